mod start;
mod status;
mod stop;

use std::path::PathBuf;
use std::time::Duration;

use maestro::{Config, Paths};
use tracing::debug;

use crate::cli::{Action, Cli};
use crate::error::{CliError, Result};
use crate::output::{CommandResult, ResultBuilder};

/// Pause between the stop and start halves of a restart.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

pub async fn dispatch(action: Action, cli: &Cli) -> Result<()> {
	let (config, config_path) = load_config(cli)?;

	match action {
		Action::Start { foreground } => start::run(&config, &config_path, foreground, cli.verbose, cli.format).await?,
		Action::Stop => {
			stop::run(&config, cli.format).await?;
		}
		Action::Restart => {
			stop::run(&config, cli.format).await?;
			tokio::time::sleep(RESTART_PAUSE).await;
			start::run(&config, &config_path, false, cli.verbose, cli.format).await?;
		}
		Action::Status => status::run(&config, cli.format)?,
	}

	Ok(())
}

/// Envelope for a command that ended in an error.
pub fn failure(action: Action, err: &CliError) -> CommandResult<()> {
	ResultBuilder::new(action.name()).message(err.to_string()).failed().build()
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
	let paths = Paths::from_env();
	let path = cli.config.clone().unwrap_or_else(|| paths.default_config_file());
	debug!(target = "maestro.cli", path = %path.display(), "loading configuration");
	let config = Config::load(&path, &paths)?;
	Ok((config, path))
}
