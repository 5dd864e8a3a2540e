//! Wire types for the maestro session bus.
//!
//! This crate contains the fixed-layout values that cross process boundaries
//! through shared memory: bus messages, channel keys and application state.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond encoding/decoding
//! * Fixed layout: A [`Message`] is always [`MESSAGE_WORDS`] little words, no pointers
//! * Stable: Changes only together with [`PROTOCOL_VERSION`]
//!
//! Higher-level session logic is built on top of these types in `maestro-rs`.

pub mod channel;
pub mod message;
pub mod state;

pub use channel::*;
pub use message::*;
pub use state::*;

/// Version stamped into every world header.
///
/// A joiner presenting any other value is refused; there is no negotiation.
pub const PROTOCOL_VERSION: u32 = 3;
