//! Owner-side sequencing of a whole session.
//!
//! Startup: create the world and arena, start routing the owner channel into
//! the [`SessionController`], bring up the window-system bridge, start the
//! status bar and wait (bounded) for it to report `Ready`, then start home.
//!
//! Steady state lasts until the status bar exits, a quit is broadcast by
//! another process, or the owner receives SIGTERM/SIGINT. Dead records are
//! reaped on a fixed interval meanwhile.
//!
//! Shutdown: broadcast `SwitchMode(Quit)`, wait (bounded) for the registry to
//! drain, sweep what is left, terminate leftover children, then tear down the
//! bridge, the arena and the world in that order.

use std::future::Future;
use std::sync::Arc;

use maestro_protocol::{AppState, Channel, Lifecycle, Message, MessageType};
use maestro_runtime::{Arena, ArenaError, ConnectError, Connection, SessionHandle, SubscribeError, SubscriptionTask, poll_until};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::app_manager::{AppManager, HOME_APP, STATUSBAR_APP, StartError};
use crate::bridge::{BridgeError, WindowManagerCallbacks, WindowSystemBridge};
use crate::config::Config;
use crate::controller::{Roles, SessionController};
use crate::launcher::ProcessLauncher;

#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error(transparent)]
	Connect(#[from] ConnectError),

	#[error("maestro is already running on world {0}")]
	AlreadyRunning(u32),

	#[error(transparent)]
	Arena(#[from] ArenaError),

	#[error(transparent)]
	Subscribe(#[from] SubscribeError),

	#[error(transparent)]
	Bridge(#[from] BridgeError),

	#[error("failed to start {name}")]
	Start {
		name: &'static str,
		#[source]
		source: StartError,
	},

	#[error("{name} did not become ready after {attempts} attempts")]
	StartupTimeout { name: &'static str, attempts: u32 },
}

/// Why steady state ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
	StatusBarExited,
	QuitRequested,
	Signal,
}

pub struct Orchestrator {
	config: Config,
	launcher: Arc<dyn ProcessLauncher>,
	bridge: Box<dyn WindowSystemBridge>,
}

/// Everything alive between startup and teardown.
struct Running {
	session: SessionHandle,
	controller: Arc<SessionController>,
	manager: Arc<AppManager>,
	quit: Arc<Notify>,
	tasks: Vec<SubscriptionTask>,
}

impl Orchestrator {
	pub fn new(config: Config, launcher: Arc<dyn ProcessLauncher>, bridge: Box<dyn WindowSystemBridge>) -> Self {
		Self { config, launcher, bridge }
	}

	/// Becomes the owner of the configured world and runs until shutdown.
	pub async fn run(self) -> Result<(), OrchestratorError> {
		let (connection, created) = self.config.connector().connect_async(false).await?;
		if !connection.is_owner() {
			return Err(OrchestratorError::AlreadyRunning(self.config.world_index));
		}
		debug!(target = "maestro.orchestrator", created, "owner connection established");
		self.run_in(connection, shutdown_signal()).await
	}

	/// Runs a session on an owner connection until `shutdown` resolves or the
	/// session ends by itself.
	pub async fn run_in(mut self, connection: Connection, shutdown: impl Future<Output = ()>) -> Result<(), OrchestratorError> {
		let started = std::time::Instant::now();
		let running = self.bring_up(&connection)?;

		let quit = running.quit.clone();
		let stop = async move {
			tokio::select! {
				_ = shutdown => Exit::Signal,
				_ = quit.notified() => Exit::QuitRequested,
			}
		};
		tokio::pin!(stop);

		let startup = tokio::select! {
			startup = self.start_apps(&running) => Some(startup),
			exit = &mut stop => {
				info!(target = "maestro.orchestrator", ?exit, "stopped during startup");
				None
			}
		};

		let outcome = match startup {
			Some(Ok(statusbar)) => {
				let exit = self.supervise(&running, statusbar, &mut stop).await;
				info!(target = "maestro.orchestrator", ?exit, "leaving steady state");
				Ok(())
			}
			Some(Err(err)) => {
				error!(target = "maestro.orchestrator", error = %err, "startup failed");
				Err(err)
			}
			None => Ok(()),
		};

		self.tear_down(running).await;
		info!(target = "maestro.orchestrator", uptime = ?started.elapsed(), "session ended");
		drop(connection);
		outcome
	}

	fn bring_up(&mut self, connection: &Connection) -> Result<Running, OrchestratorError> {
		let session = Arena::init_once(connection, &self.config.arena())?;
		let controller = Arc::new(SessionController::new(session.clone(), Roles::from_config(&self.config)));
		let interval = self.config.poll_interval;

		let inbox = {
			let controller = controller.clone();
			session.bus().subscribe(Channel::Owner, move |message| {
				controller.handle(message);
			})?
		};

		let quit = Arc::new(Notify::new());
		let broadcast = {
			let quit = quit.clone();
			let me = session.identity();
			session.bus().subscribe(Channel::Broadcast, move |message| {
				if message.sender != me && message.kind == MessageType::SwitchMode && message.state == AppState::Quit {
					quit.notify_one();
				}
			})?
		};
		let tasks = vec![inbox.spawn(interval), broadcast.spawn(interval)];

		let manager = Arc::new(AppManager::from_config(&self.config, session.clone(), self.launcher.clone()));
		self.bridge.init(manager.clone(), &self.config.display)?;
		info!(target = "maestro.orchestrator", index = self.config.world_index, "session up");

		Ok(Running {
			session,
			controller,
			manager,
			quit,
			tasks,
		})
	}

	/// Starts the status bar behind the startup barrier, then home.
	async fn start_apps(&self, running: &Running) -> Result<u32, OrchestratorError> {
		let start = |name: &'static str| {
			let manager = running.manager.clone();
			async move { manager.start_request(name).await.map_err(|source| OrchestratorError::Start { name, source }) }
		};

		let statusbar = start(STATUSBAR_APP).await?;
		let registry = running.session.registry();
		poll_until(self.config.startup_poll_limit, self.config.poll_interval, || {
			registry.find(|r| r.pid == statusbar && r.lifecycle == Lifecycle::Ready).map(|_| ())
		})
		.await
		.map_err(|timeout| OrchestratorError::StartupTimeout {
			name: STATUSBAR_APP,
			attempts: timeout.attempts,
		})?;
		info!(target = "maestro.orchestrator", pid = statusbar, "status bar ready");

		let home = start(HOME_APP).await?;
		info!(target = "maestro.orchestrator", pid = home, "home started");
		Ok(statusbar)
	}

	async fn supervise(&self, running: &Running, statusbar: u32, stop: impl Future<Output = Exit>) -> Exit {
		let mut reap = tokio::time::interval(self.config.reap_interval);
		reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		let exited = self.launcher.wait(statusbar);
		tokio::pin!(exited, stop);

		loop {
			tokio::select! {
				status = &mut exited => {
					match status {
						Ok(code) => info!(target = "maestro.orchestrator", pid = statusbar, ?code, "status bar exited"),
						Err(err) => warn!(target = "maestro.orchestrator", pid = statusbar, error = %err, "lost track of status bar"),
					}
					running.manager.process_removed(statusbar);
					return Exit::StatusBarExited;
				}
				exit = &mut stop => return exit,
				_ = reap.tick() => {
					running.controller.reap_dead(|pid| self.launcher.is_running(pid));
				}
			}
		}
	}

	async fn tear_down(&mut self, running: Running) {
		let Running {
			session,
			controller,
			manager,
			tasks,
			..
		} = running;

		let quit = Message::new(session.identity(), MessageType::SwitchMode, AppState::Quit);
		if let Err(err) = session.bus().post(Channel::Broadcast, quit) {
			warn!(target = "maestro.orchestrator", error = %err, "quit broadcast not delivered");
		}

		let registry = session.registry();
		let drained = poll_until(self.config.shutdown_poll_limit, self.config.poll_interval, || {
			controller.reap_dead(|pid| self.launcher.is_running(pid));
			registry.is_empty().then_some(())
		})
		.await;
		if let Err(timeout) = drained {
			warn!(target = "maestro.orchestrator", remaining = registry.len(), waited = ?timeout.waited, "applications did not quit in time");
		}

		for record in registry.remove_where(|_| true) {
			warn!(target = "maestro.orchestrator", pid = record.pid, title = %record.title, "swept leftover record");
		}
		let signalled = manager.stop_all();
		if signalled > 0 {
			info!(target = "maestro.orchestrator", signalled, "terminated leftover applications");
		}

		drop(tasks);
		self.bridge.shutdown();
		let failures = Arena::teardown(&session);
		if failures > 0 {
			warn!(target = "maestro.orchestrator", failures, "arena teardown incomplete");
		}
	}
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
	let interrupt = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			warn!(target = "maestro.orchestrator", error = %err, "cannot listen for SIGINT");
			std::future::pending::<()>().await;
		}
	};
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(err) => {
				warn!(target = "maestro.orchestrator", error = %err, "cannot listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};
	tokio::select! {
		_ = interrupt => info!(target = "maestro.orchestrator", "SIGINT received"),
		_ = terminate => info!(target = "maestro.orchestrator", "SIGTERM received"),
	}
}
