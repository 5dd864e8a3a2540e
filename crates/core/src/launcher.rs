//! Spawning and supervising application processes.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use maestro_runtime::process::{pid_is_alive, terminate};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Environment variable telling a child which world to join.
pub const WORLD_INDEX_ENV: &str = "MAESTRO_WORLD_INDEX";

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("failed to spawn {path}: {source}")]
	Spawn {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("spawned {0} but the OS reported no pid")]
	NoPid(PathBuf),

	#[error("failed to wait for pid {pid}: {source}")]
	Wait {
		pid: u32,
		#[source]
		source: io::Error,
	},
}

/// Process control the orchestrator depends on.
///
/// Tests substitute an in-process implementation that never forks.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
	/// Starts `path` and returns its pid.
	async fn spawn(&self, path: &Path) -> Result<u32, SpawnError>;

	/// Resolves once `pid` has exited, with its exit code when known.
	async fn wait(&self, pid: u32) -> Result<Option<i32>, SpawnError>;

	fn terminate(&self, pid: u32) -> io::Result<()>;

	fn is_running(&self, pid: u32) -> bool;
}

/// Launches real executables with [`tokio::process`].
pub struct SystemLauncher {
	world_index: u32,
	children: Mutex<HashMap<u32, Child>>,
	exit_poll: Duration,
}

impl SystemLauncher {
	pub fn new(world_index: u32) -> Self {
		Self {
			world_index,
			children: Mutex::new(HashMap::new()),
			exit_poll: Duration::from_millis(50),
		}
	}
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
	async fn spawn(&self, path: &Path) -> Result<u32, SpawnError> {
		let child = Command::new(path)
			.env(WORLD_INDEX_ENV, self.world_index.to_string())
			.stdin(Stdio::null())
			.kill_on_drop(false)
			.spawn()
			.map_err(|source| SpawnError::Spawn {
				path: path.to_path_buf(),
				source,
			})?;
		let pid = child.id().ok_or_else(|| SpawnError::NoPid(path.to_path_buf()))?;
		info!(target = "maestro.apps", pid, path = %path.display(), "spawned");
		self.children.lock().insert(pid, child);
		Ok(pid)
	}

	async fn wait(&self, pid: u32) -> Result<Option<i32>, SpawnError> {
		let child = self.children.lock().remove(&pid);
		match child {
			Some(mut child) => {
				let status = child.wait().await.map_err(|source| SpawnError::Wait { pid, source })?;
				debug!(target = "maestro.apps", pid, %status, "child exited");
				Ok(status.code())
			}
			None => {
				// Not our child: we can only watch for it to disappear.
				while pid_is_alive(pid) {
					tokio::time::sleep(self.exit_poll).await;
				}
				Ok(None)
			}
		}
	}

	fn terminate(&self, pid: u32) -> io::Result<()> {
		terminate(pid)
	}

	fn is_running(&self, pid: u32) -> bool {
		let mut children = self.children.lock();
		match children.get_mut(&pid) {
			Some(child) => match child.try_wait() {
				Ok(None) => true,
				Ok(Some(_)) | Err(_) => {
					children.remove(&pid);
					false
				}
			},
			None => pid_is_alive(pid),
		}
	}
}
