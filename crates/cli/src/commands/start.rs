use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use maestro::{Config, HeadlessBridge, Orchestrator, OrchestratorError, SystemLauncher};
use tracing::{debug, info, warn};

use crate::error::{CliError, Result};
use crate::output::{OutputFormat, ResultBuilder, StartData, print_result};

const ALREADY_RUNNING: &str = "Maestro is already running!";
const STARTUP_POLL: Duration = Duration::from_millis(10);
const STARTUP_POLL_LIMIT: u32 = 1000;

pub async fn run(config: &Config, config_path: &Path, foreground: bool, verbose: u8, format: OutputFormat) -> Result<()> {
	if foreground {
		return run_foreground(config, format).await;
	}

	if maestro::is_running(config)? {
		report_already_running(config, format);
		return Ok(());
	}

	let mut child = spawn_daemon(config, config_path, verbose)?;
	info!(target = "maestro.cli", pid = child.id(), "daemon spawned");

	let mut exited = None;
	let up = maestro::poll_until(STARTUP_POLL_LIMIT, STARTUP_POLL, || {
		if let Ok(Some(status)) = child.try_wait() {
			exited = Some(status);
			return Some(());
		}
		match maestro::status(config) {
			Ok(Some(_)) => Some(()),
			Ok(None) => None,
			Err(err) => {
				debug!(target = "maestro.cli", error = %err, "daemon not ready yet");
				None
			}
		}
	})
	.await;

	if let Some(status) = exited {
		return Err(CliError::DaemonExited {
			status,
			log: config.log_file(),
		});
	}
	if let Err(timeout) = up {
		return Err(CliError::StartTimeout {
			attempts: timeout.attempts,
			log: config.log_file(),
		});
	}

	let result = ResultBuilder::new("start")
		.data(StartData {
			started: true,
			pid: Some(child.id()),
			world_index: config.world_index,
		})
		.message(format!("Maestro started (pid: {})", child.id()))
		.build();
	print_result(&result, format);
	Ok(())
}

async fn run_foreground(config: &Config, format: OutputFormat) -> Result<()> {
	let launcher = Arc::new(SystemLauncher::new(config.world_index));
	let orchestrator = Orchestrator::new(config.clone(), launcher, Box::new(HeadlessBridge::new()));
	info!(target = "maestro.cli", pid = std::process::id(), index = config.world_index, "Maestro is running");

	match orchestrator.run().await {
		Ok(()) => Ok(()),
		Err(OrchestratorError::AlreadyRunning(_)) => {
			report_already_running(config, format);
			Ok(())
		}
		Err(err) => Err(err.into()),
	}
}

fn report_already_running(config: &Config, format: OutputFormat) {
	let result = ResultBuilder::new("start")
		.data(StartData {
			started: false,
			pid: None,
			world_index: config.world_index,
		})
		.message(ALREADY_RUNNING)
		.build();
	print_result(&result, format);
}

/// Re-executes this binary as a detached session leader running the owner.
fn spawn_daemon(config: &Config, config_path: &Path, verbose: u8) -> Result<Child> {
	let exe = std::env::current_exe().context("failed to locate the maestro executable")?;
	let config_path = std::fs::canonicalize(config_path).with_context(|| format!("failed to resolve {}", config_path.display()))?;

	let mut command = Command::new(exe);
	command.arg("--start").arg("--foreground").arg("--config").arg(&config_path);
	for _ in 0..verbose {
		command.arg("-v");
	}

	let workdir = if config.data_dir.is_dir() { config.data_dir.as_path() } else { Path::new("/") };
	command.current_dir(workdir).stdin(Stdio::null()).stdout(Stdio::null());

	let log = config.log_file();
	match OpenOptions::new().create(true).append(true).open(&log) {
		Ok(file) => {
			command.stderr(Stdio::from(file));
		}
		Err(err) => {
			warn!(target = "maestro.cli", path = %log.display(), error = %err, "cannot open log file, daemon output discarded");
			command.stderr(Stdio::null());
		}
	}

	// SAFETY: only async-signal-safe calls between fork and exec.
	unsafe {
		command.pre_exec(|| {
			if libc::setsid() < 0 {
				return Err(io::Error::last_os_error());
			}
			Ok(())
		});
	}

	Ok(command.spawn().context("failed to spawn the maestro daemon")?)
}
