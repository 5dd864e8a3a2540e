mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{RecordingBridge, SimLauncher, TICK, init_tracing, test_config};
use maestro::{
	AppState, Arena, ArenaConfig, Channel, Lifecycle, LocalWorld, Message, MessageType, Orchestrator, OrchestratorError, PROTOCOL_VERSION, ProcessLauncher, SessionHandle, Visibility,
};
use maestro_runtime::{RegistryError, poll_until};

async fn observer(world: &LocalWorld) -> (maestro::Connection, SessionHandle) {
	let connection = world.join(PROTOCOL_VERSION).unwrap();
	let session = Arena::join_with_retry(&connection, 500, TICK).await.unwrap();
	(connection, session)
}

async fn wait_for(limit: u32, probe: impl FnMut() -> Option<()>) {
	poll_until(limit, Duration::from_millis(2), probe).await.unwrap();
}

#[tokio::test]
async fn test_status_bar_barrier_then_home_until_status_bar_exits() {
	init_tracing();
	let dir = tempfile::tempdir().unwrap();
	let config = test_config(dir.path());
	let (world, owner) = LocalWorld::create(config.pool_bytes(), PROTOCOL_VERSION).unwrap();
	let launcher = Arc::new(SimLauncher::new(world.clone()));
	let bridge = RecordingBridge::default();

	let statusbar_path = config.statusbar.clone();
	let home_path = config.home.clone();
	let orchestrator = Orchestrator::new(config, launcher.clone(), Box::new(bridge.clone()));
	let returned = AtomicBool::new(false);

	let run = async {
		let result = orchestrator.run_in(owner, std::future::pending()).await;
		returned.store(true, Ordering::SeqCst);
		result
	};

	let drive = async {
		let (_conn, session) = observer(&world).await;
		wait_for(2000, || (session.registry().len() == 2).then_some(())).await;

		let statusbar = launcher.pid_of(&statusbar_path).unwrap();
		let home = launcher.pid_of(&home_path).unwrap();
		let bar = session.registry().find_by_pid(statusbar).and_then(|h| session.registry().get(h)).unwrap();
		assert_eq!(bar.lifecycle, Lifecycle::Ready);
		assert!(session.registry().find_by_pid(home).is_some());

		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(!returned.load(Ordering::SeqCst), "returned before the status bar exited");
		launcher.crash(statusbar);
		home
	};

	let (result, home) = tokio::join!(run, drive);
	result.unwrap();
	assert!(returned.load(Ordering::SeqCst));
	assert_eq!(launcher.spawned(), 2);
	// Home left on the quit broadcast.
	assert!(!launcher.is_running(home));
	assert_eq!(*bridge.events.lock(), vec!["init statusbar_height=50".to_string(), "shutdown".to_string()]);
	assert!(!world.world().is_running());
}

#[tokio::test]
async fn test_startup_barrier_times_out() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = test_config(dir.path());
	config.startup_poll_limit = 25;
	let (world, owner) = LocalWorld::create(config.pool_bytes(), PROTOCOL_VERSION).unwrap();
	let launcher = Arc::new(SimLauncher::new(world.clone()).never_ready(config.statusbar.clone()));

	let orchestrator = Orchestrator::new(config, launcher.clone(), Box::new(RecordingBridge::default()));
	let err = orchestrator.run_in(owner, std::future::pending()).await.unwrap_err();
	assert!(matches!(err, OrchestratorError::StartupTimeout { attempts: 25, .. }));
	// Home is never started after a failed barrier.
	assert_eq!(launcher.spawned(), 1);
}

#[tokio::test]
async fn test_quit_broadcast_from_another_process_ends_session() {
	let dir = tempfile::tempdir().unwrap();
	let config = test_config(dir.path());
	let (world, owner) = LocalWorld::create(config.pool_bytes(), PROTOCOL_VERSION).unwrap();
	let launcher = Arc::new(SimLauncher::new(world.clone()));
	let orchestrator = Orchestrator::new(config, launcher.clone(), Box::new(RecordingBridge::default()));

	let drive = async {
		let (conn, session) = observer(&world).await;
		wait_for(2000, || (session.registry().len() == 2).then_some(())).await;
		let quit = Message::new(conn.identity(), MessageType::SwitchMode, AppState::Quit);
		session.bus().post(Channel::Broadcast, quit).unwrap();
	};

	let (result, ()) = tokio::join!(orchestrator.run_in(owner, std::future::pending()), drive);
	result.unwrap();
	assert_eq!(launcher.spawned(), 2);
}

#[tokio::test]
async fn test_shutdown_future_ends_session() {
	let dir = tempfile::tempdir().unwrap();
	let config = test_config(dir.path());
	let (world, owner) = LocalWorld::create(config.pool_bytes(), PROTOCOL_VERSION).unwrap();
	let launcher = Arc::new(SimLauncher::new(world.clone()));
	let orchestrator = Orchestrator::new(config, launcher.clone(), Box::new(RecordingBridge::default()));

	let shutdown = async {
		let (_conn, session) = observer(&world).await;
		wait_for(2000, || (session.registry().len() == 2).then_some(())).await;
	};
	orchestrator.run_in(owner, shutdown).await.unwrap();
	assert_eq!(launcher.spawned(), 2);
}

#[tokio::test]
async fn test_crashed_app_is_reaped_and_home_shown() {
	init_tracing();
	let dir = tempfile::tempdir().unwrap();
	let mut config = test_config(dir.path());
	config.reap_interval = Duration::from_millis(5);
	let (world, owner) = LocalWorld::create(config.pool_bytes(), PROTOCOL_VERSION).unwrap();
	let launcher = Arc::new(SimLauncher::new(world.clone()));
	let bridge = RecordingBridge::default();
	let home_path = config.home.clone();
	let statusbar_path = config.statusbar.clone();
	let orchestrator = Orchestrator::new(config, launcher.clone(), Box::new(bridge.clone()));

	let drive = async {
		let (_conn, session) = observer(&world).await;
		wait_for(2000, || (session.registry().len() == 2).then_some(())).await;
		let visibility_of = |pid: u32| session.registry().find_by_pid(pid).and_then(|h| session.registry().get(h)).map(|r| r.visibility);

		// A third application started through the window-system callbacks.
		let callbacks = bridge.callbacks.lock().clone().unwrap();
		assert!(callbacks.start_request("Home").await.is_err());
		let osk = callbacks.start_request("OSK").await.unwrap();
		wait_for(2000, || (session.registry().len() == 3).then_some(())).await;
		launcher.crash(osk);
		wait_for(2000, || session.registry().find_by_pid(osk).is_none().then_some(())).await;

		// An ordinary application takes the foreground, then dies.
		let home = launcher.pid_of(&home_path).unwrap();
		let clock = launcher.spawn(&dir.path().join("clock")).await.unwrap();
		wait_for(2000, || session.registry().find(|r| r.pid == clock && r.lifecycle == Lifecycle::Ready).map(|_| ())).await;
		let (_, record) = session.registry().find(|r| r.pid == clock).unwrap();
		let request = Message::new(record.identity, MessageType::ModeRequest, AppState::Visible);
		session.bus().post(Channel::Owner, request).unwrap();
		wait_for(2000, || (visibility_of(clock) == Some(Visibility::Visible)).then_some(())).await;
		assert_eq!(visibility_of(home), Some(Visibility::Hidden));

		launcher.crash(clock);
		wait_for(2000, || session.registry().find_by_pid(clock).is_none().then_some(())).await;
		wait_for(2000, || (visibility_of(home) == Some(Visibility::Visible)).then_some(())).await;
		let home_record = session.registry().find_by_pid(home).and_then(|h| session.registry().get(h)).unwrap();
		assert_eq!(home_record.lifecycle, Lifecycle::Ready);

		launcher.crash(launcher.pid_of(&statusbar_path).unwrap());
	};

	let (result, ()) = tokio::join!(orchestrator.run_in(owner, std::future::pending()), drive);
	result.unwrap();
	assert!(!world.world().is_running());
}

#[tokio::test]
async fn test_ready_round_trip_through_registry() {
	let (_world, owner) = LocalWorld::create(128 * 1024, PROTOCOL_VERSION).unwrap();
	let session = Arena::init_once(&owner, &ArenaConfig::default()).unwrap();
	session.registry().register(7, 700, "clock", "/bin/clock").unwrap();

	let handle = session.registry().find_by_identity(7).unwrap();
	session.registry().mutate(handle, |r| r.lifecycle = Lifecycle::Ready).unwrap();

	let registry = session.registry().clone();
	let found = poll_until(10, TICK, || registry.find(|r| r.identity == 7 && r.lifecycle == Lifecycle::Ready).map(|(_, r)| r.pid)).await;
	assert_eq!(found, Ok(700));
}

#[tokio::test]
async fn test_full_registry_rejects_and_preserves_records() {
	let (_world, owner) = LocalWorld::create(128 * 1024, PROTOCOL_VERSION).unwrap();
	let session = Arena::init_once(&owner, &ArenaConfig::default()).unwrap();
	for identity in 2..12 {
		session.registry().register(identity, identity * 10, &format!("app{identity}"), "/bin/app").unwrap();
	}
	let before = session.registry().snapshot();

	let err = session.registry().register(12, 120, "one too many", "/bin/app").unwrap_err();
	assert_eq!(err, RegistryError::Full { capacity: 10 });
	assert_eq!(session.registry().snapshot(), before);
}
