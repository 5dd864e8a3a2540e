use std::io::{self, Write};
use std::time::Instant;

use serde::Serialize;

use crate::output::format::OutputFormat;
use crate::output::model::{CommandResult, SCHEMA_VERSION};

/// Builder for constructing command results.
pub struct ResultBuilder<T: Serialize> {
	command: String,
	data: Option<T>,
	message: Option<String>,
	failed: bool,
	start_time: Instant,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			data: None,
			message: None,
			failed: false,
			start_time: Instant::now(),
		}
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	/// Line shown in text mode; carried as `message` in JSON.
	pub fn message(mut self, message: impl Into<String>) -> Self {
		self.message = Some(message.into());
		self
	}

	pub fn failed(mut self) -> Self {
		self.failed = true;
		self
	}

	pub fn build(self) -> CommandResult<T> {
		CommandResult {
			schema_version: SCHEMA_VERSION,
			ok: !self.failed,
			command: self.command,
			data: self.data,
			message: self.message,
			duration_ms: Some(self.start_time.elapsed().as_millis() as u64),
		}
	}
}

/// Print a command result to stdout in the specified format.
///
/// Text mode prints only the message; commands with richer text output
/// render it themselves.
pub fn print_result<T: Serialize>(result: &CommandResult<T>, format: OutputFormat) {
	match format {
		OutputFormat::Json => {
			if let Ok(json) = serde_json::to_string_pretty(result) {
				println!("{json}");
			}
		}
		OutputFormat::Text => {
			if let Some(ref message) = result.message {
				let _ = writeln!(io::stdout().lock(), "{message}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::output::StopData;

	#[test]
	fn test_envelope_shape() {
		let result = ResultBuilder::new("stop")
			.data(StopData {
				was_running: false,
				stopped: false,
			})
			.message("Maestro is not running")
			.build();
		let json = serde_json::to_value(&result).unwrap();
		assert_eq!(json["ok"], true);
		assert_eq!(json["command"], "stop");
		assert_eq!(json["schemaVersion"], SCHEMA_VERSION);
		assert_eq!(json["data"]["wasRunning"], false);
		assert_eq!(json["message"], "Maestro is not running");
	}

	#[test]
	fn test_failed_result() {
		let result: CommandResult<()> = ResultBuilder::new("start").message("boom").failed().build();
		assert!(!result.ok);
		assert!(result.data.is_none());
	}
}
