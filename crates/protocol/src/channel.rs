//! Bus channel keys.

use serde::{Deserialize, Serialize};

/// Identity of the owner process on the bus.
pub const OWNER_IDENTITY: u32 = 1;

/// First identity handed to a joining process.
///
/// Identities below this collide with the fixed channel keys.
pub const FIRST_JOINER_IDENTITY: u32 = 2;

/// An addressable destination on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
	/// Inbound to the owner (key 0).
	Owner,
	/// Fan-out to every attached process (key 1).
	Broadcast,
	/// Inbound to the process with this bus identity.
	App(u32),
}

impl Channel {
	pub fn key(self) -> u32 {
		match self {
			Channel::Owner => 0,
			Channel::Broadcast => 1,
			Channel::App(identity) => identity,
		}
	}

	pub fn from_key(key: u32) -> Self {
		match key {
			0 => Channel::Owner,
			1 => Channel::Broadcast,
			identity => Channel::App(identity),
		}
	}

	/// Channels that only live while their application does.
	pub fn is_per_app(self) -> bool {
		matches!(self, Channel::App(_))
	}
}

impl std::fmt::Display for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Channel::Owner => write!(f, "owner"),
			Channel::Broadcast => write!(f, "broadcast"),
			Channel::App(identity) => write!(f, "app:{identity}"),
		}
	}
}
