use std::time::Duration;

use maestro::{Config, StopResult, poll_until};
use tracing::{info, warn};

use crate::error::Result;
use crate::output::{OutputFormat, ResultBuilder, StopData, print_result};

const EXIT_POLL: Duration = Duration::from_millis(20);
const EXIT_POLL_LIMIT: u32 = 500;

/// Broadcasts quit and waits (bounded) for the owner to go away.
///
/// Returns whether an owner was running.
pub async fn run(config: &Config, format: OutputFormat) -> Result<bool> {
	let result = match maestro::stop(config)? {
		StopResult::NotRunning => ResultBuilder::new("stop")
			.data(StopData {
				was_running: false,
				stopped: false,
			})
			.message("Maestro is not running"),
		StopResult::QuitBroadcast => {
			let gone = poll_until(EXIT_POLL_LIMIT, EXIT_POLL, || match maestro::is_running(config) {
				Ok(true) => None,
				Ok(false) => Some(()),
				Err(err) => {
					warn!(target = "maestro.cli", error = %err, "cannot probe world while stopping");
					None
				}
			})
			.await;
			let stopped = gone.is_ok();
			info!(target = "maestro.cli", stopped, "stop requested");
			ResultBuilder::new("stop")
				.data(StopData { was_running: true, stopped })
				.message(if stopped { "Maestro stopped" } else { "Maestro is still shutting down" })
		}
	};

	let result = result.build();
	print_result(&result, format);
	Ok(result.data.as_ref().is_some_and(|d| d.was_running))
}
