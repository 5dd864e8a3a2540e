use maestro_runtime::{ArenaError, ConnectError, OskError, PostError, RegistryError, SubscribeError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::orchestrator::OrchestratorError;

/// Errors surfaced by the library's public operations.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Connect(#[from] ConnectError),

	#[error(transparent)]
	Arena(#[from] ArenaError),

	#[error(transparent)]
	Registry(#[from] RegistryError),

	#[error(transparent)]
	Post(#[from] PostError),

	#[error(transparent)]
	Subscribe(#[from] SubscribeError),

	#[error(transparent)]
	Osk(#[from] OskError),

	#[error(transparent)]
	Orchestrator(#[from] OrchestratorError),

	#[error("application is not registered")]
	NotRegistered,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// `true` when the failure only means no session is running.
	pub fn is_not_running(&self) -> bool {
		matches!(self, Error::Connect(ConnectError::NotRunning(_)))
	}
}
