use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Maestro(#[from] maestro::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("maestro did not come up after {attempts} attempts; see {}", .log.display())]
	StartTimeout { attempts: u32, log: PathBuf },

	#[error("maestro exited during startup ({status}); see {}", .log.display())]
	DaemonExited { status: std::process::ExitStatus, log: PathBuf },

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl From<maestro::ConfigError> for CliError {
	fn from(err: maestro::ConfigError) -> Self {
		CliError::Maestro(err.into())
	}
}

impl From<maestro::OrchestratorError> for CliError {
	fn from(err: maestro::OrchestratorError) -> Self {
		CliError::Maestro(err.into())
	}
}

pub type Result<T> = std::result::Result<T, CliError>;
