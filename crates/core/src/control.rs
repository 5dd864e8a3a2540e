//! One-shot commands run against a live world from another process.

use maestro_protocol::{AppState, Channel, Lifecycle, Message, MessageType, Visibility};
use maestro_runtime::{Arena, ConnectError, Connection};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopResult {
	NotRunning,
	QuitBroadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatus {
	/// Registry slot.
	pub index: usize,
	pub pid: u32,
	pub title: String,
	pub visibility: Visibility,
	pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
	pub world_index: u32,
	pub owner_pid: u32,
	pub uptime_secs: u64,
	pub capacity: usize,
	pub apps: Vec<AppStatus>,
}

fn connect(config: &Config) -> Result<Option<Connection>> {
	match config.connector().connect(true) {
		Ok((connection, _)) => Ok(Some(connection)),
		Err(ConnectError::NotRunning(index)) => {
			debug!(target = "maestro.cli", index, "no owner");
			Ok(None)
		}
		Err(err) => Err(err.into()),
	}
}

/// `true` while an owner holds the configured world.
pub fn is_running(config: &Config) -> Result<bool> {
	Ok(connect(config)?.is_some())
}

/// Asks every process in the world, the owner included, to quit.
pub fn stop(config: &Config) -> Result<StopResult> {
	let Some(connection) = connect(config)? else {
		return Ok(StopResult::NotRunning);
	};
	let session = Arena::join(&connection)?;
	let quit = Message::new(connection.identity(), MessageType::SwitchMode, AppState::Quit);
	session.bus().post(Channel::Broadcast, quit)?;
	info!(target = "maestro.cli", index = config.world_index, "quit broadcast");
	Ok(StopResult::QuitBroadcast)
}

/// Snapshot of the running world, or `None` when nothing is running.
pub fn status(config: &Config) -> Result<Option<StatusReport>> {
	let Some(connection) = connect(config)? else {
		return Ok(None);
	};
	let session = Arena::join(&connection)?;
	let world = connection.world();
	let apps = session
		.registry()
		.snapshot()
		.into_iter()
		.map(|(handle, record)| AppStatus {
			index: handle.index(),
			pid: record.pid,
			title: record.title,
			visibility: record.visibility,
			lifecycle: record.lifecycle,
		})
		.collect();

	Ok(Some(StatusReport {
		world_index: world.index(),
		owner_pid: world.owner_pid(),
		uptime_secs: world.uptime().as_secs(),
		capacity: session.registry().capacity(),
		apps,
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Paths;

	fn config(index: u32) -> Config {
		let mut config = Config::defaults(&Paths::new("/tmp", "/tmp"));
		config.world_index = index;
		config
	}

	fn unused_index(salt: u32) -> u32 {
		0x5000_0000 | (std::process::id() << 4) | salt
	}

	#[test]
	fn test_stop_without_owner() {
		assert_eq!(stop(&config(unused_index(1))).unwrap(), StopResult::NotRunning);
	}

	#[test]
	fn test_is_running_without_owner() {
		assert!(!is_running(&config(unused_index(4))).unwrap());
	}

	#[test]
	fn test_status_without_owner() {
		assert_eq!(status(&config(unused_index(2))).unwrap(), None);
	}

	#[test]
	fn test_status_and_stop_against_live_world() {
		let config = config(unused_index(3));
		let (owner, created) = config.connector().connect(false).unwrap();
		assert!(created);
		let session = Arena::init_once(&owner, &config.arena()).unwrap();
		session.registry().register(9, 900, "Clock", "/bin/clock").unwrap();

		let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
		let sink = seen.clone();
		let mut broadcast = session.bus().subscribe(Channel::Broadcast, move |m| sink.lock().push(m)).unwrap();

		let report = status(&config).unwrap().unwrap();
		assert_eq!(report.owner_pid, std::process::id());
		assert_eq!(report.capacity, config.app_vector_size);
		assert_eq!(report.apps.len(), 1);
		assert_eq!((report.apps[0].pid, report.apps[0].title.as_str()), (900, "Clock"));

		assert!(is_running(&config).unwrap());
		assert_eq!(stop(&config).unwrap(), StopResult::QuitBroadcast);
		broadcast.pump();
		let quit = seen.lock()[0];
		assert_eq!((quit.kind, quit.state), (MessageType::SwitchMode, AppState::Quit));
		assert_ne!(quit.sender, owner.identity());
	}
}
