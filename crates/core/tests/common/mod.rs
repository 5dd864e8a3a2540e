//! In-process application processes for driving an orchestrator in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use maestro::{
	AppSession, AppState, BridgeError, Config, DisplaySettings, Lifecycle, LocalWorld, MessageType, PROTOCOL_VERSION, Paths, ProcessLauncher,
	SpawnError, WindowManagerCallbacks, WindowSystemBridge,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

pub const TICK: Duration = Duration::from_millis(1);

/// Routes library logs through the test harness's captured output.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

pub fn test_config(dir: &Path) -> Config {
	let mut config = Config::defaults(&Paths::new(dir, "/opt/maestro-test/bin"));
	config.pool_size = 512;
	config
}

struct SimProcess {
	path: PathBuf,
	kill: watch::Sender<bool>,
	exited: watch::Receiver<bool>,
}

/// Launcher whose "processes" are tokio tasks joined to a [`LocalWorld`].
///
/// Each simulated application registers with its fake pid, reports `Ready`
/// (unless its executable is listed in `never_ready`) and follows the
/// default command handling of [`AppSession`] until told to quit.
pub struct SimLauncher {
	world: LocalWorld,
	next_pid: AtomicU32,
	never_ready: HashSet<PathBuf>,
	processes: Mutex<HashMap<u32, SimProcess>>,
}

impl SimLauncher {
	pub fn new(world: LocalWorld) -> Self {
		Self {
			world,
			next_pid: AtomicU32::new(50_000),
			never_ready: HashSet::new(),
			processes: Mutex::new(HashMap::new()),
		}
	}

	pub fn never_ready(mut self, path: impl Into<PathBuf>) -> Self {
		self.never_ready.insert(path.into());
		self
	}

	pub fn pid_of(&self, path: &Path) -> Option<u32> {
		self.processes.lock().iter().find(|(_, p)| p.path == path).map(|(pid, _)| *pid)
	}

	pub fn spawned(&self) -> usize {
		self.processes.lock().len()
	}

	/// Simulates the process dying without any cleanup message.
	pub fn crash(&self, pid: u32) {
		if let Some(process) = self.processes.lock().get(&pid) {
			let _ = process.kill.send(true);
		}
	}
}

async fn run_app(world: LocalWorld, pid: u32, path: PathBuf, ready: bool, mut kill: watch::Receiver<bool>) -> anyhow::Result<()> {
	let mut app = AppSession::join(world.join(PROTOCOL_VERSION)?, 200, TICK).await?;
	let title = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
	app.register(&title, &path, Some(pid))?;

	let (tx, mut rx) = mpsc::unbounded_channel();
	let own = {
		let tx = tx.clone();
		app.subscribe_my_channel(move |m| {
			let _ = tx.send(m);
		})?
		.spawn(TICK)
	};
	let broadcast = app
		.subscribe_broadcast(move |m| {
			let _ = tx.send(m);
		})?
		.spawn(TICK);

	app.notify(AppState::Initialising)?;
	if ready {
		app.set_lifecycle(Lifecycle::Ready)?;
		app.notify(AppState::Ready)?;
	}

	let crashed = loop {
		tokio::select! {
			Some(message) = rx.recv() => {
				app.handle_command(message);
				if message.kind == MessageType::SwitchMode && message.state == AppState::Quit {
					break false;
				}
			}
			_ = kill.changed() => break true,
		}
	};

	drop((own, broadcast));
	if crashed {
		// A dead process never withdraws its record.
		std::mem::forget(app);
	}
	Ok(())
}

#[async_trait]
impl ProcessLauncher for SimLauncher {
	async fn spawn(&self, path: &Path) -> Result<u32, SpawnError> {
		let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
		let (kill, kill_rx) = watch::channel(false);
		let (exited_tx, exited) = watch::channel(false);
		let ready = !self.never_ready.contains(path);
		let world = self.world.clone();
		let owned = path.to_path_buf();
		tokio::spawn(async move {
			if let Err(err) = run_app(world, pid, owned, ready, kill_rx).await {
				eprintln!("simulated app {pid} failed: {err:#}");
			}
			let _ = exited_tx.send(true);
		});
		self.processes.lock().insert(pid, SimProcess {
			path: path.to_path_buf(),
			kill,
			exited,
		});
		Ok(pid)
	}

	async fn wait(&self, pid: u32) -> Result<Option<i32>, SpawnError> {
		let exited = self.processes.lock().get(&pid).map(|p| p.exited.clone());
		if let Some(mut exited) = exited {
			let _ = exited.wait_for(|&done| done).await;
		}
		Ok(Some(0))
	}

	fn terminate(&self, pid: u32) -> io::Result<()> {
		self.crash(pid);
		Ok(())
	}

	fn is_running(&self, pid: u32) -> bool {
		self.processes.lock().get(&pid).is_some_and(|p| !*p.exited.borrow())
	}
}

/// Bridge that records what the session asked of it.
#[derive(Clone, Default)]
pub struct RecordingBridge {
	pub events: Arc<Mutex<Vec<String>>>,
	pub callbacks: Arc<Mutex<Option<Arc<dyn WindowManagerCallbacks>>>>,
}

impl WindowSystemBridge for RecordingBridge {
	fn init(&mut self, callbacks: Arc<dyn WindowManagerCallbacks>, settings: &DisplaySettings) -> Result<(), BridgeError> {
		self.events.lock().push(format!("init statusbar_height={}", settings.statusbar_height));
		*self.callbacks.lock() = Some(callbacks);
		Ok(())
	}

	fn shutdown(&mut self) {
		self.events.lock().push("shutdown".to_string());
		self.callbacks.lock().take();
	}
}
