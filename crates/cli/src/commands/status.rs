use std::fmt::Write as _;
use std::time::Duration;

use colored::Colorize;
use maestro::{Config, StatusReport, Visibility};

use crate::error::Result;
use crate::output::{OutputFormat, ResultBuilder, print_result};

pub fn run(config: &Config, format: OutputFormat) -> Result<()> {
	let report = maestro::status(config)?;

	match format {
		OutputFormat::Json => {
			let builder = ResultBuilder::new("status");
			let result = match report {
				Some(report) => builder.data(report),
				None => builder.message("Please start Maestro"),
			};
			print_result(&result.build(), format);
		}
		OutputFormat::Text => match report {
			Some(report) => print!("{}", render(&report)),
			None => println!("Please start Maestro"),
		},
	}
	Ok(())
}

/// `HH:MM:SS`, prefixed with the day count once it reaches a day.
pub fn format_uptime(uptime: Duration) -> String {
	let secs = uptime.as_secs();
	let days = secs / 86_400;
	let hours = secs % 86_400 / 3_600;
	let minutes = secs % 3_600 / 60;
	let seconds = secs % 60;
	match days {
		0 => format!("{hours:02}:{minutes:02}:{seconds:02}"),
		1 => format!("1 day, {hours:02}:{minutes:02}:{seconds:02}"),
		n => format!("{n} days, {hours:02}:{minutes:02}:{seconds:02}"),
	}
}

pub fn render(report: &StatusReport) -> String {
	let mut out = String::new();
	let _ = writeln!(out, "\nMaestro (pid: {}) uptime: {}", report.owner_pid, format_uptime(Duration::from_secs(report.uptime_secs)));

	if report.apps.is_empty() {
		let _ = writeln!(out, "There aren't any applications running...");
		return out;
	}

	let _ = writeln!(out, "\n#\tPID\t{:<20}\tStatus", "Title");
	let _ = writeln!(out, "{}", "-".repeat(60));
	for app in &report.apps {
		let status = match app.visibility {
			Visibility::Visible => "Visible".green().to_string(),
			Visibility::Hidden => "Hidden".to_string(),
		};
		let _ = writeln!(out, "{}\t{}\t{:<30}\t{}", app.index, app.pid, app.title, status);
	}
	out
}
