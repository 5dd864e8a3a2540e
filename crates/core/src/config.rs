//! Daemon configuration, read from a `maestro.conf` key-value file.
//!
//! One `KEY = VALUE` (or `KEY VALUE`) pair per line, `#` starts a comment
//! line. Unknown keys are ignored. Executable names resolve against the
//! binary directory and image names against the data directory unless they
//! are absolute.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use maestro_runtime::{ArenaConfig, WorldConnector};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "maestro.conf";
pub const DEFAULT_DATA_DIR: &str = "/usr/local/share/maestro/";
pub const DEFAULT_BIN_DIR: &str = "/usr/local/bin/";

/// Largest accepted `POOL_SIZE`, in KiB.
pub const MAX_POOL_KIB: usize = 1 << 30;
pub const MAX_APP_VECTOR_SIZE: usize = 4096;
pub const MAX_OSK_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("unable to open configuration file {}", path.display())]
	Missing {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("invalid value {value:?} for {key} on line {line}")]
	InvalidValue { key: String, line: usize, value: String },

	#[error("{key} = {value} on line {line} exceeds the maximum of {max}")]
	OutOfRange { key: String, line: usize, value: usize, max: usize },
}

/// Install locations used to resolve relative names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
	pub data_dir: PathBuf,
	pub bin_dir: PathBuf,
}

impl Paths {
	pub fn new(data_dir: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>) -> Self {
		Self {
			data_dir: data_dir.into(),
			bin_dir: bin_dir.into(),
		}
	}

	/// Reads `MAESTRO_DATADIR` / `MAESTRO_BINDIR`, falling back to the install defaults.
	pub fn from_env() -> Self {
		let data_dir = std::env::var_os("MAESTRO_DATADIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
		let bin_dir = std::env::var_os("MAESTRO_BINDIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_BIN_DIR));
		Self { data_dir, bin_dir }
	}

	pub fn default_config_file(&self) -> PathBuf {
		self.data_dir.join(CONFIG_FILE_NAME)
	}

	fn executable(&self, value: &str) -> PathBuf {
		resolve(&self.bin_dir, value)
	}

	fn data(&self, value: &str) -> PathBuf {
		resolve(&self.data_dir, value)
	}
}

fn resolve(base: &Path, value: &str) -> PathBuf {
	let path = Path::new(value);
	if path.is_absolute() { path.to_path_buf() } else { base.join(path) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
	#[default]
	Color,
	Image,
}

/// Settings handed to the window-system bridge; the core never renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisplaySettings {
	pub background_mode: BackgroundMode,
	pub background_image: Option<PathBuf>,
	pub background_color: [u8; 3],
	pub busy_image: Option<PathBuf>,
	pub cursor_enabled: bool,
	pub cursor_image: Option<PathBuf>,
	pub cursor_hot_spot: (i32, i32),
	pub statusbar_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	pub world_index: u32,
	/// Shared pool size in KiB.
	pub pool_size: usize,
	/// Registry capacity.
	pub app_vector_size: usize,
	pub osk_size: usize,
	/// Parsed for compatibility; there is no clipboard.
	pub clipboard_size: usize,
	pub display: DisplaySettings,
	pub statusbar: PathBuf,
	pub home: PathBuf,
	pub osk: PathBuf,
	pub poll_interval: Duration,
	pub startup_poll_limit: u32,
	pub shutdown_poll_limit: u32,
	pub reap_interval: Duration,
	pub data_dir: PathBuf,
}

impl Config {
	pub fn defaults(paths: &Paths) -> Self {
		Self {
			world_index: 0,
			pool_size: 1024,
			app_vector_size: 10,
			osk_size: 10,
			clipboard_size: 10,
			display: DisplaySettings {
				statusbar_height: 50,
				..DisplaySettings::default()
			},
			statusbar: paths.executable("maestro_statusbar"),
			home: paths.executable("maestro_home"),
			osk: paths.executable("maestro_osk"),
			poll_interval: Duration::from_millis(2),
			startup_poll_limit: 2500,
			shutdown_poll_limit: 100,
			reap_interval: Duration::from_millis(500),
			data_dir: paths.data_dir.clone(),
		}
	}

	/// Reads `path`; a missing file is an error.
	pub fn load(path: &Path, paths: &Paths) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Missing {
			path: path.to_path_buf(),
			source,
		})?;
		debug!(target = "maestro.config", path = %path.display(), "parsing configuration file");
		Self::parse(&text, paths)
	}

	pub fn parse(text: &str, paths: &Paths) -> Result<Self, ConfigError> {
		let mut config = Self::defaults(paths);

		for (number, raw) in text.lines().enumerate() {
			let line = raw.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let Some((key, value)) = split_pair(line) else {
				debug!(target = "maestro.config", line = number + 1, "skipping line without a value");
				continue;
			};
			let line_no = number + 1;

			match key {
				"WORLD_INDEX" => config.world_index = parse_num(key, line_no, value)?,
				"POOL_SIZE" => config.pool_size = parse_bounded(key, line_no, value, MAX_POOL_KIB)?,
				"APP_VECTOR_SIZE" => config.app_vector_size = parse_bounded(key, line_no, value, MAX_APP_VECTOR_SIZE)?,
				"OSK_SIZE" => config.osk_size = parse_bounded(key, line_no, value, MAX_OSK_SIZE)?,
				"CLIPBOARD_SIZE" => config.clipboard_size = parse_num(key, line_no, value)?,
				"BACKGROUND_MODE" => {
					config.display.background_mode = if value.eq_ignore_ascii_case("IMAGE") { BackgroundMode::Image } else { BackgroundMode::Color }
				}
				"BACKGROUND_IMAGE" => config.display.background_image = Some(paths.data(value)),
				"BACKGROUND_COLOR_R" => config.display.background_color[0] = parse_num(key, line_no, value)?,
				"BACKGROUND_COLOR_G" => config.display.background_color[1] = parse_num(key, line_no, value)?,
				"BACKGROUND_COLOR_B" => config.display.background_color[2] = parse_num(key, line_no, value)?,
				"BUSY_IMAGE" => config.display.busy_image = Some(paths.data(value)),
				"CURSOR_ENABLED" => config.display.cursor_enabled = parse_num::<i64>(key, line_no, value)? != 0,
				"CURSOR_IMAGE" => config.display.cursor_image = Some(paths.data(value)),
				"CURSOR_HOT_X" => config.display.cursor_hot_spot.0 = parse_num(key, line_no, value)?,
				"CURSOR_HOT_Y" => config.display.cursor_hot_spot.1 = parse_num(key, line_no, value)?,
				"STATUSBAR" => config.statusbar = paths.executable(value),
				"STATUSBAR_HEIGHT" => config.display.statusbar_height = parse_num(key, line_no, value)?,
				"HOME" => config.home = paths.executable(value),
				"OSK" => config.osk = paths.executable(value),
				"POLL_INTERVAL_MS" => config.poll_interval = Duration::from_millis(parse_num(key, line_no, value)?),
				"STARTUP_POLL_LIMIT" => config.startup_poll_limit = parse_num(key, line_no, value)?,
				"SHUTDOWN_POLL_LIMIT" => config.shutdown_poll_limit = parse_num(key, line_no, value)?,
				"REAP_INTERVAL_MS" => config.reap_interval = Duration::from_millis(parse_num(key, line_no, value)?),
				other => debug!(target = "maestro.config", key = other, "ignoring unknown key"),
			}
		}

		Ok(config)
	}

	/// Pool size in bytes, saturating for sizes set past the parser.
	pub fn pool_bytes(&self) -> usize {
		self.pool_size.saturating_mul(1024)
	}

	pub fn arena(&self) -> ArenaConfig {
		ArenaConfig {
			registry_capacity: self.app_vector_size,
			osk_size: self.osk_size,
			..ArenaConfig::default()
		}
	}

	pub fn connector(&self) -> WorldConnector {
		WorldConnector::new(self.world_index).pool_bytes(self.pool_bytes())
	}

	/// Where the daemonized owner writes its log stream.
	pub fn log_file(&self) -> PathBuf {
		self.data_dir.join(format!("maestro-{}.log", self.world_index))
	}
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
	let (key, rest) = match line.split_once('=') {
		Some((key, rest)) => (key.trim(), rest),
		None => {
			let (key, rest) = line.split_once(char::is_whitespace)?;
			(key, rest)
		}
	};
	let value = rest.trim();
	let value = value.strip_prefix('=').map(str::trim).unwrap_or(value);
	(!key.is_empty() && !value.is_empty()).then_some((key, value))
}

fn parse_num<T: FromStr>(key: &str, line: usize, value: &str) -> Result<T, ConfigError> {
	value.parse().map_err(|_| ConfigError::InvalidValue {
		key: key.to_string(),
		line,
		value: value.to_string(),
	})
}

fn parse_bounded(key: &str, line: usize, value: &str, max: usize) -> Result<usize, ConfigError> {
	let parsed = parse_num(key, line, value)?;
	if parsed > max {
		return Err(ConfigError::OutOfRange {
			key: key.to_string(),
			line,
			value: parsed,
			max,
		});
	}
	Ok(parsed)
}
