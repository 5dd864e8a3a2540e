//! The fixed-size bus message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::AppState;

/// Number of `u32` words in an encoded [`Message`].
pub const MESSAGE_WORDS: usize = 4;

/// Kind of a bus message. Some kinds only mean something between given parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
	/// Command from the session owner to an application.
	SwitchMode = 0,
	/// Request from an application to the session owner.
	ModeRequest = 1,
	/// Report of a state change.
	Notification = 2,
	/// Report of on-screen keyboard usage.
	OSKEvent = 3,
	/// Window request; currently not acted upon.
	WindowRequest = 4,
}

impl MessageType {
	pub fn from_wire(raw: u32) -> Option<Self> {
		Some(match raw {
			0 => MessageType::SwitchMode,
			1 => MessageType::ModeRequest,
			2 => MessageType::Notification,
			3 => MessageType::OSKEvent,
			4 => MessageType::WindowRequest,
			_ => return None,
		})
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("unknown message type {0}")]
	UnknownType(u32),

	#[error("unknown state payload {0:#x}")]
	UnknownState(u32),
}

/// A message copied by value onto a bus channel.
///
/// `target` is the bus identity the message refers to, `0` when unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub sender: u32,
	pub kind: MessageType,
	pub state: AppState,
	pub target: u32,
}

impl Message {
	pub fn new(sender: u32, kind: MessageType, state: AppState) -> Self {
		Self { sender, kind, state, target: 0 }
	}

	pub fn with_target(mut self, target: u32) -> Self {
		self.target = target;
		self
	}

	pub fn encode(&self) -> [u32; MESSAGE_WORDS] {
		[self.sender, self.kind as u32, self.state.to_wire(), self.target]
	}

	pub fn decode(words: [u32; MESSAGE_WORDS]) -> Result<Self, DecodeError> {
		let kind = MessageType::from_wire(words[1]).ok_or(DecodeError::UnknownType(words[1]))?;
		let state = AppState::from_wire(words[2]).ok_or(DecodeError::UnknownState(words[2]))?;
		Ok(Self {
			sender: words[0],
			kind,
			state,
			target: words[3],
		})
	}
}

impl std::fmt::Display for Message {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}({}) from {}", self.kind, self.state, self.sender)?;
		if self.target != 0 {
			write!(f, " target {}", self.target)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_layout() {
		let msg = Message::new(7, MessageType::OSKEvent, AppState::Visible).with_target(9);
		assert_eq!(msg.encode(), [7, 3, 0x40, 9]);
		assert_eq!(Message::decode(msg.encode()), Ok(msg));
	}

	#[test]
	fn decode_rejects_garbage() {
		assert_eq!(Message::decode([2, 99, 0x40, 0]), Err(DecodeError::UnknownType(99)));
		assert_eq!(Message::decode([2, 0, 0x41, 0]), Err(DecodeError::UnknownState(0x41)));
	}

	#[test]
	fn display_mentions_target_only_when_set() {
		let msg = Message::new(1, MessageType::SwitchMode, AppState::Quit);
		assert_eq!(msg.to_string(), "SwitchMode(quit) from 1");
		assert!(msg.with_target(4).to_string().ends_with("target 4"));
	}
}
