//! Allow-listed applications the window system may start and stop.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use maestro_protocol::{AppState, Channel, Message, MessageType};
use maestro_runtime::SessionHandle;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::WindowManagerCallbacks;
use crate::config::Config;
use crate::launcher::{ProcessLauncher, SpawnError};

pub const STATUSBAR_APP: &str = "StatusBar";
pub const HOME_APP: &str = "Home";
pub const OSK_APP: &str = "OSK";

#[derive(Debug, Error)]
pub enum StartError {
	#[error("no application named {0}")]
	NotFound(String),

	#[error("{name} is already running as pid {pid}")]
	Busy { name: String, pid: u32 },

	#[error("{0} is already being started")]
	Starting(String),

	#[error("failed to start {name}")]
	SpawnFailed {
		name: String,
		#[source]
		source: SpawnError,
	},
}

#[derive(Debug, Error)]
pub enum StopError {
	#[error("no application with pid {0}")]
	NotFound(u32),

	#[error("pid {0} is neither registered nor attached")]
	NotAttached(u32),

	#[error("failed to signal pid {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: io::Error,
	},
}

/// What a successful stop request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// The process had already gone; its entry was reset.
	AlreadyExited,
	/// `SwitchMode(Quit)` was posted on the application's channel.
	QuitRequested { identity: u32 },
	/// The process was sent SIGTERM.
	Signalled,
}

#[derive(Debug, Clone)]
pub struct ManagedApp {
	pub name: String,
	pub program: PathBuf,
	pub pid: Option<u32>,
	pub started: Option<Instant>,
	/// Set once the window system has seen the process.
	pub attached: bool,
	/// A start request is waiting on the launcher.
	pub starting: bool,
}

impl ManagedApp {
	pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			program: program.into(),
			pid: None,
			started: None,
			attached: false,
			starting: false,
		}
	}

	fn reset(&mut self) {
		self.pid = None;
		self.started = None;
		self.attached = false;
	}
}

pub struct AppManager {
	session: SessionHandle,
	launcher: Arc<dyn ProcessLauncher>,
	apps: Mutex<Vec<ManagedApp>>,
	windows: Mutex<HashMap<u32, Vec<u32>>>,
	focused: Mutex<Option<u32>>,
}

impl AppManager {
	pub fn new(session: SessionHandle, launcher: Arc<dyn ProcessLauncher>, apps: Vec<ManagedApp>) -> Self {
		Self {
			session,
			launcher,
			apps: Mutex::new(apps),
			windows: Mutex::new(HashMap::new()),
			focused: Mutex::new(None),
		}
	}

	/// Manager for the three applications named in the configuration.
	pub fn from_config(config: &Config, session: SessionHandle, launcher: Arc<dyn ProcessLauncher>) -> Self {
		let apps = vec![
			ManagedApp::new(STATUSBAR_APP, &config.statusbar),
			ManagedApp::new(HOME_APP, &config.home),
			ManagedApp::new(OSK_APP, &config.osk),
		];
		Self::new(session, launcher, apps)
	}

	pub fn apps(&self) -> Vec<ManagedApp> {
		self.apps.lock().clone()
	}

	pub fn app(&self, name: &str) -> Option<ManagedApp> {
		self.apps.lock().iter().find(|a| a.name == name).cloned()
	}

	pub fn focused(&self) -> Option<u32> {
		*self.focused.lock()
	}

	pub fn windows(&self, pid: u32) -> Vec<u32> {
		self.windows.lock().get(&pid).cloned().unwrap_or_default()
	}

	/// Terminates every managed process still running. Returns how many were signalled.
	pub fn stop_all(&self) -> usize {
		let mut apps = self.apps.lock();
		let mut signalled = 0;
		for app in apps.iter_mut() {
			let Some(pid) = app.pid else { continue };
			if self.launcher.is_running(pid) {
				match self.launcher.terminate(pid) {
					Ok(()) => {
						info!(target = "maestro.apps", name = %app.name, pid, "terminated");
						signalled += 1;
					}
					Err(err) => warn!(target = "maestro.apps", name = %app.name, pid, error = %err, "failed to terminate"),
				}
			}
			app.reset();
		}
		signalled
	}
}

/// Clears an app's `starting` mark when the start request ends, including
/// when the request future is dropped mid-spawn.
struct PendingStart<'a> {
	apps: &'a Mutex<Vec<ManagedApp>>,
	name: &'a str,
}

impl PendingStart<'_> {
	fn finish(&mut self, update: impl FnOnce(&mut ManagedApp)) {
		if let Some(app) = self.apps.lock().iter_mut().find(|a| a.name == self.name) {
			app.starting = false;
			update(app);
		}
	}
}

impl Drop for PendingStart<'_> {
	fn drop(&mut self) {
		self.finish(|_| {});
	}
}

#[async_trait]
impl WindowManagerCallbacks for AppManager {
	async fn start_request(&self, name: &str) -> Result<u32, StartError> {
		let program = {
			let mut apps = self.apps.lock();
			let app = apps.iter_mut().find(|a| a.name == name).ok_or_else(|| StartError::NotFound(name.to_string()))?;
			if app.starting {
				return Err(StartError::Starting(name.to_string()));
			}
			if let Some(pid) = app.pid.filter(|&pid| self.launcher.is_running(pid)) {
				return Err(StartError::Busy {
					name: name.to_string(),
					pid,
				});
			}
			app.starting = true;
			app.program.clone()
		};

		let mut pending = PendingStart { apps: &self.apps, name };
		let pid = self.launcher.spawn(&program).await.map_err(|source| StartError::SpawnFailed {
			name: name.to_string(),
			source,
		})?;

		pending.finish(|app| {
			app.pid = Some(pid);
			app.started = Some(Instant::now());
			app.attached = false;
		});
		info!(target = "maestro.apps", name, pid, "started");
		Ok(pid)
	}

	async fn stop_request(&self, pid: u32, requester: u32) -> Result<StopOutcome, StopError> {
		let managed = self.apps.lock().iter().position(|a| a.pid == Some(pid));
		let record = self.session.registry().find(|r| r.pid == pid).map(|(_, r)| r);

		if managed.is_none() && record.is_none() {
			debug!(target = "maestro.apps", pid, requester, "stop request for unknown pid");
			return Err(StopError::NotFound(pid));
		}

		if let Some(index) = managed {
			if !self.launcher.is_running(pid) {
				if let Some(app) = self.apps.lock().get_mut(index) {
					app.reset();
				}
				return Ok(StopOutcome::AlreadyExited);
			}
		}

		if let Some(record) = &record {
			let quit = Message::new(self.session.identity(), MessageType::SwitchMode, AppState::Quit);
			match self.session.bus().post(Channel::App(record.identity), quit) {
				Ok(()) => {
					info!(target = "maestro.apps", pid, requester, title = %record.title, "asked to quit");
					return Ok(StopOutcome::QuitRequested { identity: record.identity });
				}
				Err(err) => warn!(target = "maestro.apps", pid, error = %err, "quit request not delivered, signalling instead"),
			}
		}

		let attached = managed.and_then(|i| self.apps.lock().get(i).map(|a| a.attached)).unwrap_or(false);
		if !attached && record.is_none() {
			return Err(StopError::NotAttached(pid));
		}
		self.launcher.terminate(pid).map_err(|source| StopError::Signal { pid, source })?;
		info!(target = "maestro.apps", pid, requester, "signalled");
		Ok(StopOutcome::Signalled)
	}

	fn process_added(&self, pid: u32) {
		if let Some(app) = self.apps.lock().iter_mut().find(|a| a.pid == Some(pid)) {
			app.attached = true;
			debug!(target = "maestro.apps", name = %app.name, pid, "process attached");
		}
	}

	fn process_removed(&self, pid: u32) {
		if let Some(app) = self.apps.lock().iter_mut().find(|a| a.pid == Some(pid)) {
			debug!(target = "maestro.apps", name = %app.name, pid, "process detached");
			app.reset();
		}
		self.windows.lock().remove(&pid);
		let mut focused = self.focused.lock();
		if *focused == Some(pid) {
			*focused = None;
		}
	}

	fn window_added(&self, pid: u32, window: u32) {
		self.windows.lock().entry(pid).or_default().push(window);
	}

	fn window_removed(&self, pid: u32, window: u32) {
		let mut windows = self.windows.lock();
		if let Some(list) = windows.get_mut(&pid) {
			list.retain(|&w| w != window);
			if list.is_empty() {
				windows.remove(&pid);
			}
		}
	}

	fn switch_focus(&self, pid: u32) {
		debug!(target = "maestro.apps", pid, "focus switched");
		*self.focused.lock() = Some(pid);
	}
}
