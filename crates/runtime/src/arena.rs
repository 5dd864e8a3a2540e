//! The named block of session objects inside a world.
//!
//! The owner allocates the session object, registry, bus and keyboard buffer
//! from the world pool and publishes them by name; joiners look the names up
//! and build views over the same memory.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::barrier::poll_until;
use crate::bus::Bus;
use crate::osk::OskBuffer;
use crate::registry::Registry;
use crate::world::{Connection, World};

pub const SESSION_OBJECT: &str = "SessionObject";
pub const APP_VECTOR: &str = "AppVector";

const SESSION_MAGIC: u32 = 0x5345_5353;

#[repr(C)]
struct SessionObject {
	magic: AtomicU32,
	channels: AtomicU32,
	bus_offset: AtomicU64,
	registry_offset: AtomicU64,
	osk_offset: AtomicU64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
	#[error("only the world owner may initialise the arena")]
	NotOwner,

	#[error("arena has not been published yet")]
	ArenaNotFound,

	#[error("pool exhausted while allocating the {0}")]
	AllocationFailed(&'static str),

	#[error("arena is corrupt: {0}")]
	Corrupt(String),
}

/// Sizes fixed at arena creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
	pub registry_capacity: usize,
	pub osk_size: usize,
	/// Cells per bus ring.
	pub bus_depth: usize,
	/// Rings on the bus; defaults to one per record plus the fixed channels and spare.
	pub bus_channels: Option<usize>,
}

impl Default for ArenaConfig {
	fn default() -> Self {
		Self {
			registry_capacity: 10,
			osk_size: 10,
			bus_depth: 64,
			bus_channels: None,
		}
	}
}

impl ArenaConfig {
	fn channels(&self) -> usize {
		self.bus_channels.unwrap_or(self.registry_capacity.saturating_add(4))
	}
}

/// Everything a process needs to take part in the session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
	world: World,
	identity: u32,
	is_owner: bool,
	session_offset: usize,
	bus: Bus,
	registry: Registry,
	osk: OskBuffer,
}

impl SessionHandle {
	pub fn world(&self) -> &World {
		&self.world
	}

	/// Bus identity of the process holding this handle.
	pub fn identity(&self) -> u32 {
		self.identity
	}

	pub fn is_owner(&self) -> bool {
		self.is_owner
	}

	pub fn bus(&self) -> &Bus {
		&self.bus
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	pub fn osk(&self) -> &OskBuffer {
		&self.osk
	}

	fn session_object(&self) -> &SessionObject {
		// SAFETY: the offset was published by the owner for a SessionObject.
		unsafe { self.world.segment().at(self.session_offset) }
	}
}

pub struct Arena;

impl Arena {
	/// Allocates and publishes the session objects. Owner only.
	pub fn init_once(conn: &Connection, config: &ArenaConfig) -> Result<SessionHandle, ArenaError> {
		if !conn.is_owner() {
			return Err(ArenaError::NotOwner);
		}
		let world = conn.world();
		if world.lookup(SESSION_OBJECT).is_some() {
			debug!(target = "maestro.arena", "arena already published");
			return Self::join(conn);
		}

		let session_offset = world
			.alloc(std::mem::size_of::<SessionObject>(), 8)
			.ok_or(ArenaError::AllocationFailed("session object"))?;
		let registry = Registry::create(world, config.registry_capacity).ok_or(ArenaError::AllocationFailed("application registry"))?;
		let bus = Bus::create(world, config.channels(), config.bus_depth).ok_or(ArenaError::AllocationFailed("message bus"))?;
		let osk = OskBuffer::create(world, config.osk_size).ok_or(ArenaError::AllocationFailed("keyboard buffer"))?;

		let handle = SessionHandle {
			world: world.clone(),
			identity: conn.identity(),
			is_owner: true,
			session_offset,
			bus,
			registry,
			osk,
		};

		let session = handle.session_object();
		session.channels.store(config.channels() as u32, Ordering::Relaxed);
		session.bus_offset.store(handle.bus.offset() as u64, Ordering::Relaxed);
		session.registry_offset.store(handle.registry.offset() as u64, Ordering::Relaxed);
		session.osk_offset.store(handle.osk.offset() as u64, Ordering::Relaxed);
		session.magic.store(SESSION_MAGIC, Ordering::Release);

		if !world.publish(APP_VECTOR, handle.registry.offset()) || !world.publish(SESSION_OBJECT, session_offset) {
			return Err(ArenaError::AllocationFailed("arena directory entry"));
		}

		info!(
			target = "maestro.arena",
			capacity = config.registry_capacity,
			channels = config.channels(),
			osk_size = config.osk_size,
			pool_used = world.pool_used(),
			"arena initialised"
		);
		Ok(handle)
	}

	/// Locates the session objects the owner published.
	pub fn join(conn: &Connection) -> Result<SessionHandle, ArenaError> {
		let world = conn.world();
		let session_offset = world.lookup(SESSION_OBJECT).ok_or(ArenaError::ArenaNotFound)?;
		let len = world.segment().len();
		if session_offset + std::mem::size_of::<SessionObject>() > len {
			return Err(ArenaError::Corrupt(format!("session object at {session_offset} is outside the world")));
		}

		// SAFETY: bounds checked above; the object is plain atomics.
		let session: &SessionObject = unsafe { world.segment().at(session_offset) };
		if session.magic.load(Ordering::Acquire) != SESSION_MAGIC {
			return Err(ArenaError::ArenaNotFound);
		}

		let offsets = [
			session.registry_offset.load(Ordering::Relaxed) as usize,
			session.bus_offset.load(Ordering::Relaxed) as usize,
			session.osk_offset.load(Ordering::Relaxed) as usize,
		];
		if let Some(bad) = offsets.iter().find(|&&o| o == 0 || o >= len) {
			return Err(ArenaError::Corrupt(format!("session object points outside the world ({bad})")));
		}
		if world.lookup(APP_VECTOR) != Some(offsets[0]) {
			return Err(ArenaError::Corrupt("application registry entry disagrees with session object".to_string()));
		}

		let segment = world.segment().clone();
		Ok(SessionHandle {
			world: world.clone(),
			identity: conn.identity(),
			is_owner: conn.is_owner(),
			session_offset,
			registry: Registry::open(segment.clone(), offsets[0]),
			bus: Bus::open(segment.clone(), offsets[1]),
			osk: OskBuffer::open(segment, offsets[2]),
		})
	}

	/// Retries [`Arena::join`] while the owner is still initialising.
	pub async fn join_with_retry(conn: &Connection, limit: u32, interval: Duration) -> Result<SessionHandle, ArenaError> {
		let joined = poll_until(limit, interval, || match Self::join(conn) {
			Err(ArenaError::ArenaNotFound) => None,
			other => Some(other),
		})
		.await;
		joined.unwrap_or_else(|timeout| {
			warn!(target = "maestro.arena", attempts = timeout.attempts, "arena never appeared");
			Err(ArenaError::ArenaNotFound)
		})
	}

	/// Releases the arena in order: bus, registry, session object, pool.
	///
	/// Every step runs even if an earlier one fails; returns the number of
	/// steps that failed.
	pub fn teardown(session: &SessionHandle) -> usize {
		let steps: [(&str, &dyn Fn() -> Result<String, String>); 4] = [
			("detach bus", &|| Ok(format!("{} channels unbound", session.bus.detach()))),
			("destroy registry", &|| Ok(format!("{} records dropped", session.registry.destroy()))),
			("free session object", &|| {
				session.session_object().magic.store(0, Ordering::Release);
				let found = session.world.unpublish(SESSION_OBJECT) & session.world.unpublish(APP_VECTOR);
				if found { Ok("unpublished".to_string()) } else { Err("directory entries missing".to_string()) }
			}),
			("release pool", &|| {
				let used = session.world.pool_used();
				session.world.release_pool();
				Ok(format!("{used} bytes released"))
			}),
		];

		let mut failures = 0;
		for (step, run) in steps {
			match run() {
				Ok(detail) => debug!(target = "maestro.arena", step, %detail, "teardown step done"),
				Err(reason) => {
					failures += 1;
					warn!(target = "maestro.arena", step, %reason, "teardown step failed");
				}
			}
		}
		info!(target = "maestro.arena", failures, "arena torn down");
		failures
	}
}

#[cfg(test)]
mod tests {
	use maestro_protocol::{AppState, Channel, Message, MessageType, PROTOCOL_VERSION};

	use super::*;
	use crate::registry::RegistryError;
	use crate::world::LocalWorld;

	#[test]
	fn test_joiner_sees_owner_objects() {
		let (local, owner) = LocalWorld::create(128 * 1024, PROTOCOL_VERSION).unwrap();
		let joiner = local.join(PROTOCOL_VERSION).unwrap();
		assert_eq!(Arena::join(&joiner).unwrap_err(), ArenaError::ArenaNotFound);

		let config = ArenaConfig {
			registry_capacity: 3,
			..ArenaConfig::default()
		};
		let owned = Arena::init_once(&owner, &config).unwrap();
		let joined = Arena::join(&joiner).unwrap();
		assert!(!joined.is_owner());
		assert_eq!(joined.identity(), joiner.identity());
		assert_eq!(joined.registry().capacity(), 3);

		let h = joined.registry().register(joiner.identity(), 42, "app", "/bin/app").unwrap();
		assert_eq!(owned.registry().find_by_pid(42), Some(h));

		owned.osk().write("abc").unwrap();
		assert_eq!(joined.osk().read(), "abc");
	}

	#[test]
	fn test_only_owner_initialises() {
		let (local, _owner) = LocalWorld::create(64 * 1024, PROTOCOL_VERSION).unwrap();
		let joiner = local.join(PROTOCOL_VERSION).unwrap();
		assert_eq!(Arena::init_once(&joiner, &ArenaConfig::default()).unwrap_err(), ArenaError::NotOwner);
	}

	#[test]
	fn test_small_pool_fails_allocation() {
		let (_local, owner) = LocalWorld::create(256, PROTOCOL_VERSION).unwrap();
		let err = Arena::init_once(&owner, &ArenaConfig::default()).unwrap_err();
		assert!(matches!(err, ArenaError::AllocationFailed(_)));
	}

	#[test]
	fn test_oversized_registry_fails_allocation() {
		let (_local, owner) = LocalWorld::create(64 * 1024, PROTOCOL_VERSION).unwrap();
		let config = ArenaConfig {
			registry_capacity: usize::MAX,
			..ArenaConfig::default()
		};
		let err = Arena::init_once(&owner, &config).unwrap_err();
		assert!(matches!(err, ArenaError::AllocationFailed(_)));
	}

	#[test]
	fn test_teardown_is_complete() {
		let (local, owner) = LocalWorld::create(128 * 1024, PROTOCOL_VERSION).unwrap();
		let session = Arena::init_once(&owner, &ArenaConfig::default()).unwrap();
		session.registry().register(2, 20, "a", "/a").unwrap();

		assert_eq!(Arena::teardown(&session), 0);
		assert_eq!(local.world().pool_used(), 0);
		assert_eq!(session.registry().register(3, 30, "b", "/b"), Err(RegistryError::Closed));
		assert!(session.bus().post(Channel::Broadcast, Message::new(1, MessageType::SwitchMode, AppState::Quit)).is_err());
		assert_eq!(Arena::join(&owner).unwrap_err(), ArenaError::ArenaNotFound);

		// A second teardown still runs every step.
		assert_eq!(Arena::teardown(&session), 1);
	}

	#[tokio::test]
	async fn test_join_with_retry_waits_for_owner() {
		let (local, owner) = LocalWorld::create(128 * 1024, PROTOCOL_VERSION).unwrap();
		let joiner = local.join(PROTOCOL_VERSION).unwrap();

		let init = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			let session = Arena::init_once(&owner, &ArenaConfig::default());
			(owner, session.is_ok())
		});
		let joined = Arena::join_with_retry(&joiner, 200, Duration::from_millis(5)).await;
		assert!(joined.is_ok());
		assert!(init.await.unwrap().1);
	}

	#[tokio::test]
	async fn test_join_with_retry_gives_up() {
		let (local, _owner) = LocalWorld::create(64 * 1024, PROTOCOL_VERSION).unwrap();
		let joiner = local.join(PROTOCOL_VERSION).unwrap();
		let err = Arena::join_with_retry(&joiner, 3, Duration::from_millis(1)).await.unwrap_err();
		assert_eq!(err, ArenaError::ArenaNotFound);
	}
}
