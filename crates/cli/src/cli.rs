use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(about = "Maestro - session coordinator for applications sharing one display")]
#[command(version)]
#[command(group(ArgGroup::new("action").args(["start", "stop", "restart", "status"])))]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Starts Maestro
	#[arg(long)]
	pub start: bool,

	/// Stops Maestro
	#[arg(long)]
	pub stop: bool,

	/// Restarts Maestro
	#[arg(long)]
	pub restart: bool,

	/// List running applications
	#[arg(long)]
	pub status: bool,

	/// Configuration file (defaults to maestro.conf in the data directory)
	#[arg(short, long, env = "MAESTRO_CONFIG", value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Output format
	#[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
	pub format: OutputFormat,

	/// Run the owner in this process instead of detaching
	#[arg(long, hide = true)]
	pub foreground: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Start { foreground: bool },
	Stop,
	Restart,
	Status,
}

impl Action {
	/// Command name carried in the JSON envelope.
	pub fn name(self) -> &'static str {
		match self {
			Action::Start { .. } => "start",
			Action::Stop => "stop",
			Action::Restart => "restart",
			Action::Status => "status",
		}
	}
}

impl Cli {
	pub fn action(&self) -> Option<Action> {
		if self.start {
			Some(Action::Start { foreground: self.foreground })
		} else if self.stop {
			Some(Action::Stop)
		} else if self.restart {
			Some(Action::Restart)
		} else if self.status {
			Some(Action::Status)
		} else {
			None
		}
	}
}
