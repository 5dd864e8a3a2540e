//! Application state as it appears on the wire and in the registry.

use serde::{Deserialize, Serialize};

/// State payload carried by a [`Message`](crate::Message).
///
/// Values keep their historical bit positions so the wire encoding of a
/// message is a plain `u32`. A message only ever carries one value; the
/// durable state of a record is split into [`Visibility`] and [`Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AppState {
	None = 0x000,
	Busy = 0x001,
	Idle = 0x002,
	Alive = 0x004,
	Initialising = 0x008,
	Ready = 0x010,
	Terminating = 0x020,
	Visible = 0x040,
	Hidden = 0x080,
	Quit = 0x100,
}

impl AppState {
	pub fn to_wire(self) -> u32 {
		self as u32
	}

	pub fn from_wire(raw: u32) -> Option<Self> {
		Some(match raw {
			0x000 => AppState::None,
			0x001 => AppState::Busy,
			0x002 => AppState::Idle,
			0x004 => AppState::Alive,
			0x008 => AppState::Initialising,
			0x010 => AppState::Ready,
			0x020 => AppState::Terminating,
			0x040 => AppState::Visible,
			0x080 => AppState::Hidden,
			0x100 => AppState::Quit,
			_ => return None,
		})
	}
}

impl std::fmt::Display for AppState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			AppState::None => "none",
			AppState::Busy => "busy",
			AppState::Idle => "idle",
			AppState::Alive => "alive",
			AppState::Initialising => "initialising",
			AppState::Ready => "ready",
			AppState::Terminating => "terminating",
			AppState::Visible => "visible",
			AppState::Hidden => "hidden",
			AppState::Quit => "quit",
		};
		f.write_str(name)
	}
}

/// Whether a record currently owns the display.
///
/// An idle application is simply `Hidden`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
	#[default]
	Hidden,
	Visible,
}

impl Visibility {
	pub fn to_raw(self) -> u8 {
		match self {
			Visibility::Hidden => 0,
			Visibility::Visible => 1,
		}
	}

	/// Decodes a stored byte; anything unknown reads as `Hidden`.
	pub fn from_raw(raw: u8) -> Self {
		if raw == 1 { Visibility::Visible } else { Visibility::Hidden }
	}

	pub fn is_visible(self) -> bool {
		self == Visibility::Visible
	}
}

impl std::fmt::Display for Visibility {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Visibility::Hidden => write!(f, "Hidden"),
			Visibility::Visible => write!(f, "Visible"),
		}
	}
}

/// Where a record is in its life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
	#[default]
	Initialising,
	Ready,
	Terminating,
	Quit,
}

impl Lifecycle {
	pub fn to_raw(self) -> u8 {
		match self {
			Lifecycle::Initialising => 0,
			Lifecycle::Ready => 1,
			Lifecycle::Terminating => 2,
			Lifecycle::Quit => 3,
		}
	}

	pub fn from_raw(raw: u8) -> Self {
		match raw {
			1 => Lifecycle::Ready,
			2 => Lifecycle::Terminating,
			3 => Lifecycle::Quit,
			_ => Lifecycle::Initialising,
		}
	}

	/// `true` once the application has started shutting down.
	pub fn is_ending(self) -> bool {
		matches!(self, Lifecycle::Terminating | Lifecycle::Quit)
	}

	/// Maps a lifecycle-bearing wire state to its durable value.
	pub fn from_state(state: AppState) -> Option<Self> {
		match state {
			AppState::Initialising => Some(Lifecycle::Initialising),
			AppState::Ready => Some(Lifecycle::Ready),
			AppState::Terminating => Some(Lifecycle::Terminating),
			AppState::Quit => Some(Lifecycle::Quit),
			_ => None,
		}
	}
}

impl std::fmt::Display for Lifecycle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Lifecycle::Initialising => write!(f, "Initialising"),
			Lifecycle::Ready => write!(f, "Ready"),
			Lifecycle::Terminating => write!(f, "Terminating"),
			Lifecycle::Quit => write!(f, "Quit"),
		}
	}
}

/// Outcome of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	Accepted,
	Dropped,
}
