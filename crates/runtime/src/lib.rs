//! Shared-memory plumbing for the maestro session.
//!
//! Everything here lives inside one mapped segment per world:
//!
//! * [`world`]: joins or creates the segment and decides owner vs joiner
//! * [`arena`]: allocates (owner) or locates (joiner) the named session objects
//! * [`bus`]: per-channel message rings with per-reader cursors
//! * [`registry`]: the lock-guarded table of application records
//! * [`osk`]: the on-screen keyboard scratch buffer
//!
//! No pointers are stored in shared memory; every structure is addressed by
//! its offset from the start of the segment, so each process may map it at a
//! different address.

pub mod arena;
pub mod barrier;
pub mod bus;
pub mod osk;
pub mod process;
pub mod registry;
pub mod shm;
pub mod world;

pub use arena::{Arena, ArenaConfig, ArenaError, SessionHandle};
pub use barrier::{PollTimeout, poll_until};
pub use bus::{Bus, PostError, SubscribeError, Subscription, SubscriptionTask};
pub use osk::{OskBuffer, OskError};
pub use registry::{AppRecord, Registry, RegistryError, RecordHandle, Transaction};
pub use world::{ConnectError, Connection, LocalWorld, World, WorldConnector, world_name};
