//! Joining or creating a world: one shared segment per world index.
//!
//! The first process to arrive creates the segment and becomes its owner;
//! everyone after that attaches as a joiner. The header at offset 0 carries
//! the protocol version gate, the owner pid (for stale detection), the
//! identity counter and a small directory of named arena objects.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use maestro_protocol::{FIRST_JOINER_IDENTITY, OWNER_IDENTITY};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{current_pid, pid_is_alive, unix_now};
use crate::shm::{Segment, ShmLock, align_up};

const WORLD_MAGIC: u64 = 0x4d41_4553_5452_4f31;
const DIRECTORY_SLOTS: usize = 8;

const STATUS_RUNNING: u32 = 1;
const STATUS_CLOSED: u32 = 2;

/// How long a joiner waits for an owner that created the segment but has
/// not finished writing the header.
const HEADER_WAIT: Duration = Duration::from_millis(500);
const HEADER_POLL: Duration = Duration::from_millis(5);

#[repr(C)]
pub(crate) struct DirectoryEntry {
	tag: AtomicU64,
	offset: AtomicU64,
}

#[repr(C)]
pub(crate) struct WorldHeader {
	magic: AtomicU64,
	protocol_version: AtomicU32,
	status: AtomicU32,
	owner_pid: AtomicU32,
	next_identity: AtomicU32,
	attached: AtomicU32,
	pool_lock: ShmLock,
	segment_len: AtomicU64,
	created_at: AtomicU64,
	pool_used: AtomicU64,
	directory: [DirectoryEntry; DIRECTORY_SLOTS],
}

/// Start of the allocation pool.
pub(crate) const POOL_BASE: usize = align_up(std::mem::size_of::<WorldHeader>(), 64);

#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("no session is running in world {0}")]
	NotRunning(u32),

	#[error("protocol version mismatch: world speaks {found}, this process speaks {expected}")]
	VersionMismatch { expected: u32, found: u32 },

	#[error("could not allocate a {len} byte world")]
	AllocationFailed {
		len: usize,
		#[source]
		source: io::Error,
	},

	#[error("world {index} is corrupt: {reason}")]
	Corrupt { index: u32, reason: String },

	#[error(transparent)]
	Io(#[from] io::Error),
}

fn segment_len(pool_bytes: usize) -> Result<usize, ConnectError> {
	POOL_BASE.checked_add(pool_bytes).ok_or_else(|| ConnectError::AllocationFailed {
		len: usize::MAX,
		source: io::Error::new(io::ErrorKind::InvalidInput, format!("pool of {pool_bytes} bytes is too large")),
	})
}

/// Name of the shared-memory object backing world `index`.
pub fn world_name(index: u32) -> String {
	format!("/maestro-world-{index}")
}

/// A mapped world. Cheap to clone; every clone shares the mapping.
#[derive(Clone, Debug)]
pub struct World {
	segment: Arc<Segment>,
	index: u32,
}

impl World {
	pub(crate) fn header(&self) -> &WorldHeader {
		// SAFETY: the header is at offset 0 and every world is at least POOL_BASE long.
		unsafe { self.segment.at(0) }
	}

	pub(crate) fn segment(&self) -> &Arc<Segment> {
		&self.segment
	}

	pub fn index(&self) -> u32 {
		self.index
	}

	pub fn owner_pid(&self) -> u32 {
		self.header().owner_pid.load(Ordering::Acquire)
	}

	/// Unix time at which the owner created the world.
	pub fn created_at(&self) -> u64 {
		self.header().created_at.load(Ordering::Relaxed)
	}

	pub fn uptime(&self) -> Duration {
		Duration::from_secs(unix_now().saturating_sub(self.created_at()))
	}

	/// Number of live connections, owner included.
	pub fn attached(&self) -> u32 {
		self.header().attached.load(Ordering::Acquire)
	}

	pub fn is_running(&self) -> bool {
		self.header().status.load(Ordering::Acquire) == STATUS_RUNNING
	}

	/// Bytes of pool in use.
	pub fn pool_used(&self) -> usize {
		self.header().pool_used.load(Ordering::Relaxed) as usize
	}

	pub fn pool_capacity(&self) -> usize {
		self.segment.len() - POOL_BASE
	}

	/// Bump-allocates `size` zeroed bytes from the pool.
	pub(crate) fn alloc(&self, size: usize, align: usize) -> Option<usize> {
		let header = self.header();
		let _guard = header.pool_lock.lock();
		let used = header.pool_used.load(Ordering::Relaxed) as usize;
		let offset = align_up(POOL_BASE + used, align.max(8));
		let end = offset.checked_add(size)?;
		if end > self.segment.len() {
			return None;
		}
		// SAFETY: the range is inside the mapping and not handed out before.
		unsafe { std::ptr::write_bytes(self.segment.byte_ptr(offset), 0, size) };
		header.pool_used.store((end - POOL_BASE) as u64, Ordering::Relaxed);
		Some(offset)
	}

	/// Returns every pool byte and forgets all published names.
	pub(crate) fn release_pool(&self) {
		let header = self.header();
		let _guard = header.pool_lock.lock();
		for entry in &header.directory {
			entry.tag.store(0, Ordering::Release);
			entry.offset.store(0, Ordering::Relaxed);
		}
		header.pool_used.store(0, Ordering::Relaxed);
	}

	/// Publishes `offset` under `name`. Fails when the directory is full.
	pub(crate) fn publish(&self, name: &str, offset: usize) -> bool {
		let tag = name_tag(name);
		let header = self.header();
		let _guard = header.pool_lock.lock();
		let slot = header
			.directory
			.iter()
			.find(|e| e.tag.load(Ordering::Relaxed) == tag)
			.or_else(|| header.directory.iter().find(|e| e.tag.load(Ordering::Relaxed) == 0));
		let Some(slot) = slot else {
			return false;
		};
		slot.offset.store(offset as u64, Ordering::Relaxed);
		slot.tag.store(tag, Ordering::Release);
		true
	}

	pub(crate) fn unpublish(&self, name: &str) -> bool {
		let tag = name_tag(name);
		let header = self.header();
		let _guard = header.pool_lock.lock();
		match header.directory.iter().find(|e| e.tag.load(Ordering::Relaxed) == tag) {
			Some(entry) => {
				entry.tag.store(0, Ordering::Release);
				true
			}
			None => false,
		}
	}

	pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
		let tag = name_tag(name);
		self.header()
			.directory
			.iter()
			.find(|e| e.tag.load(Ordering::Acquire) == tag)
			.map(|e| e.offset.load(Ordering::Relaxed) as usize)
	}

	fn initialize(&self, protocol_version: u32) {
		let header = self.header();
		header.protocol_version.store(protocol_version, Ordering::Relaxed);
		header.owner_pid.store(current_pid(), Ordering::Relaxed);
		header.next_identity.store(FIRST_JOINER_IDENTITY, Ordering::Relaxed);
		header.attached.store(1, Ordering::Relaxed);
		header.segment_len.store(self.segment.len() as u64, Ordering::Relaxed);
		header.created_at.store(unix_now(), Ordering::Relaxed);
		header.status.store(STATUS_RUNNING, Ordering::Relaxed);
		header.magic.store(WORLD_MAGIC, Ordering::Release);
	}

	fn has_magic(&self) -> bool {
		self.header().magic.load(Ordering::Acquire) == WORLD_MAGIC
	}

	/// A world is stale when its owner closed it or died without doing so.
	fn is_stale(&self) -> bool {
		!self.is_running() || !pid_is_alive(self.owner_pid())
	}

	fn check_version(&self, expected: u32) -> Result<(), ConnectError> {
		let found = self.header().protocol_version.load(Ordering::Relaxed);
		if found != expected {
			return Err(ConnectError::VersionMismatch { expected, found });
		}
		Ok(())
	}
}

/// FNV-1a over the name; zero is reserved for empty slots.
fn name_tag(name: &str) -> u64 {
	let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
	for byte in name.bytes() {
		hash ^= u64::from(byte);
		hash = hash.wrapping_mul(0x0100_0000_01b3);
	}
	hash.max(1)
}

/// One process's attachment to a world.
///
/// Dropping it is the exit hook: the attach count is released and, for the
/// owner, the world is closed and its name removed. Mappings held by other
/// processes stay valid until they drop their own connection.
#[derive(Debug)]
pub struct Connection {
	world: World,
	identity: u32,
	is_owner: bool,
}

impl Connection {
	fn owner(world: World) -> Self {
		Self {
			world,
			identity: OWNER_IDENTITY,
			is_owner: true,
		}
	}

	fn joiner(world: World) -> Self {
		let header = world.header();
		let identity = header.next_identity.fetch_add(1, Ordering::AcqRel);
		header.attached.fetch_add(1, Ordering::AcqRel);
		Self {
			world,
			identity,
			is_owner: false,
		}
	}

	pub fn world(&self) -> &World {
		&self.world
	}

	/// Bus identity of this process, unique within the world.
	pub fn identity(&self) -> u32 {
		self.identity
	}

	pub fn is_owner(&self) -> bool {
		self.is_owner
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		let header = self.world.header();
		let remaining = header.attached.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
		debug!(target = "maestro.world", identity = self.identity, remaining, "detached from world");

		if !self.is_owner {
			return;
		}
		header.status.store(STATUS_CLOSED, Ordering::Release);
		if let Some(name) = self.world.segment.name() {
			match Segment::unlink(name) {
				Ok(()) => info!(target = "maestro.world", name, "world removed"),
				Err(err) => warn!(target = "maestro.world", name, error = %err, "failed to remove world"),
			}
		}
	}
}

/// Connects to the named world for one index.
#[derive(Debug, Clone)]
pub struct WorldConnector {
	index: u32,
	protocol_version: u32,
	pool_bytes: usize,
}

impl WorldConnector {
	pub fn new(index: u32) -> Self {
		Self {
			index,
			protocol_version: maestro_protocol::PROTOCOL_VERSION,
			pool_bytes: 1024 * 1024,
		}
	}

	pub fn protocol_version(mut self, version: u32) -> Self {
		self.protocol_version = version;
		self
	}

	/// Pool size used if this process ends up creating the world.
	pub fn pool_bytes(mut self, bytes: usize) -> Self {
		self.pool_bytes = bytes;
		self
	}

	/// Joins the running world or, unless `joiner_only`, creates it.
	///
	/// Returns the connection and whether this process is the owner. Waiting
	/// for a half-written header blocks the calling thread; async callers
	/// use [`WorldConnector::connect_async`].
	pub fn connect(&self, joiner_only: bool) -> Result<(Connection, bool), ConnectError> {
		let deadline = Instant::now() + HEADER_WAIT;
		loop {
			if let Some(connected) = self.try_connect(joiner_only, Instant::now() >= deadline)? {
				return Ok(connected);
			}
			std::thread::sleep(HEADER_POLL);
		}
	}

	/// [`WorldConnector::connect`] that waits for the owner on the tokio timer.
	pub async fn connect_async(&self, joiner_only: bool) -> Result<(Connection, bool), ConnectError> {
		let deadline = Instant::now() + HEADER_WAIT;
		loop {
			if let Some(connected) = self.try_connect(joiner_only, Instant::now() >= deadline)? {
				return Ok(connected);
			}
			tokio::time::sleep(HEADER_POLL).await;
		}
	}

	/// One connection attempt; `None` while an owner is still writing the header.
	fn try_connect(&self, joiner_only: bool, header_expired: bool) -> Result<Option<(Connection, bool)>, ConnectError> {
		let name = world_name(self.index);

		// A lost creation race or a stale world sends us around again.
		for _ in 0..3 {
			match Segment::open(&name) {
				Ok(segment) => {
					let world = World {
						segment: Arc::new(segment),
						index: self.index,
					};
					match self.attach(&world, header_expired) {
						Ok(conn) => return Ok(Some((conn, false))),
						Err(AttachFailure::HeaderPending) => return Ok(None),
						Err(AttachFailure::Fatal(err)) => return Err(err),
						Err(AttachFailure::Stale) if joiner_only => return Err(ConnectError::NotRunning(self.index)),
						Err(AttachFailure::Stale) => {
							warn!(target = "maestro.world", index = self.index, owner = world.owner_pid(), "removing stale world");
							let _ = Segment::unlink(&name);
						}
					}
				}
				Err(err) if err.kind() == io::ErrorKind::NotFound || err.kind() == io::ErrorKind::InvalidData => {
					if joiner_only {
						return Err(ConnectError::NotRunning(self.index));
					}
				}
				Err(err) => return Err(ConnectError::Io(err)),
			}

			let len = segment_len(self.pool_bytes)?;
			match Segment::create(&name, len) {
				Ok(segment) => {
					let world = World {
						segment: Arc::new(segment),
						index: self.index,
					};
					world.initialize(self.protocol_version);
					info!(target = "maestro.world", index = self.index, len, "created world");
					return Ok(Some((Connection::owner(world), true)));
				}
				Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
					debug!(target = "maestro.world", index = self.index, "lost creation race, joining instead");
				}
				Err(err) => return Err(ConnectError::AllocationFailed { len, source: err }),
			}
		}

		Err(ConnectError::Corrupt {
			index: self.index,
			reason: "world kept changing while connecting".to_string(),
		})
	}

	fn attach(&self, world: &World, header_expired: bool) -> Result<Connection, AttachFailure> {
		if world.segment.len() < POOL_BASE {
			return Err(AttachFailure::Fatal(ConnectError::Corrupt {
				index: self.index,
				reason: format!("segment is only {} bytes", world.segment.len()),
			}));
		}

		if !world.has_magic() {
			return Err(if header_expired { AttachFailure::Stale } else { AttachFailure::HeaderPending });
		}
		if world.is_stale() {
			return Err(AttachFailure::Stale);
		}
		world.check_version(self.protocol_version).map_err(AttachFailure::Fatal)?;

		let conn = Connection::joiner(world.clone());
		debug!(target = "maestro.world", index = self.index, identity = conn.identity, "joined world");
		Ok(conn)
	}
}

enum AttachFailure {
	HeaderPending,
	Stale,
	Fatal(ConnectError),
}

/// A world in anonymous shared memory, for running an owner and any number
/// of joiners inside one process.
#[derive(Debug, Clone)]
pub struct LocalWorld {
	world: World,
}

impl LocalWorld {
	/// Creates the world and returns it with the owner's connection.
	pub fn create(pool_bytes: usize, protocol_version: u32) -> Result<(Self, Connection), ConnectError> {
		let len = segment_len(pool_bytes)?;
		let segment = Segment::anonymous(len).map_err(|source| ConnectError::AllocationFailed { len, source })?;
		let world = World {
			segment: Arc::new(segment),
			index: u32::MAX,
		};
		world.initialize(protocol_version);
		Ok((Self { world: world.clone() }, Connection::owner(world)))
	}

	pub fn join(&self, protocol_version: u32) -> Result<Connection, ConnectError> {
		if !self.world.is_running() {
			return Err(ConnectError::NotRunning(self.world.index));
		}
		self.world.check_version(protocol_version)?;
		Ok(Connection::joiner(self.world.clone()))
	}

	pub fn world(&self) -> &World {
		&self.world
	}
}

#[cfg(test)]
mod tests {
	use maestro_protocol::PROTOCOL_VERSION;

	use super::*;

	fn test_index(salt: u32) -> u32 {
		0x4000_0000 | (current_pid() << 4) | salt
	}

	#[test]
	fn test_joiner_only_without_owner_is_not_running() {
		let index = test_index(1);
		let err = WorldConnector::new(index).connect(true).unwrap_err();
		assert!(matches!(err, ConnectError::NotRunning(i) if i == index));
	}

	#[test]
	fn test_first_connect_owns_second_joins() {
		let index = test_index(2);
		let connector = WorldConnector::new(index).pool_bytes(64 * 1024);
		let (owner, is_owner) = connector.connect(false).unwrap();
		assert!(is_owner);
		assert_eq!(owner.identity(), OWNER_IDENTITY);

		let (a, a_owner) = connector.connect(true).unwrap();
		let (b, _) = connector.connect(false).unwrap();
		assert!(!a_owner);
		assert_eq!(a.identity(), FIRST_JOINER_IDENTITY);
		assert_eq!(b.identity(), FIRST_JOINER_IDENTITY + 1);
		assert_eq!(owner.world().attached(), 3);
		assert_eq!(a.world().owner_pid(), current_pid());

		drop(a);
		assert_eq!(owner.world().attached(), 2);
		drop(owner);
		assert!(!b.world().is_running());
		assert!(matches!(connector.connect(true), Err(ConnectError::NotRunning(_))));
	}

	#[test]
	fn test_version_mismatch_is_refused() {
		let index = test_index(3);
		let (_owner, _) = WorldConnector::new(index).pool_bytes(4096).connect(false).unwrap();
		let err = WorldConnector::new(index).protocol_version(PROTOCOL_VERSION + 1).connect(true).unwrap_err();
		assert!(matches!(err, ConnectError::VersionMismatch { found, .. } if found == PROTOCOL_VERSION));
	}

	#[test]
	fn test_closed_world_is_recreated_by_next_owner() {
		let index = test_index(4);
		let name = world_name(index);
		// Leave a closed but still-linked segment behind.
		{
			let segment = Segment::create(&name, POOL_BASE + 4096).unwrap();
			let world = World {
				segment: Arc::new(segment),
				index,
			};
			world.initialize(PROTOCOL_VERSION);
			world.header().status.store(STATUS_CLOSED, Ordering::Release);
		}

		assert!(matches!(WorldConnector::new(index).connect(true), Err(ConnectError::NotRunning(_))));
		let (owner, is_owner) = WorldConnector::new(index).pool_bytes(4096).connect(false).unwrap();
		assert!(is_owner);
		assert!(owner.world().is_running());
	}

	#[tokio::test]
	async fn test_async_connect_waits_for_header_without_blocking() {
		let index = test_index(5);
		let name = world_name(index);
		let segment = Segment::create(&name, POOL_BASE + 4096).unwrap();
		let world = World {
			segment: Arc::new(segment),
			index,
		};

		// The owner finishes its header on the same single-threaded runtime.
		let owner = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			world.initialize(PROTOCOL_VERSION);
			Connection::owner(world)
		});

		let (joiner, is_owner) = WorldConnector::new(index).connect_async(true).await.unwrap();
		assert!(!is_owner);
		assert_eq!(joiner.identity(), FIRST_JOINER_IDENTITY);
		drop(joiner);
		drop(owner.await.unwrap());
	}

	#[test]
	fn test_oversized_pool_is_refused() {
		let err = WorldConnector::new(test_index(6)).pool_bytes(usize::MAX).connect(false).unwrap_err();
		assert!(matches!(err, ConnectError::AllocationFailed { .. }));
		assert!(matches!(LocalWorld::create(usize::MAX, PROTOCOL_VERSION), Err(ConnectError::AllocationFailed { .. })));
	}

	#[test]
	fn test_directory_publish_and_lookup() {
		let (local, _owner) = LocalWorld::create(8192, PROTOCOL_VERSION).unwrap();
		let world = local.world();
		let offset = world.alloc(100, 64).unwrap();
		assert_eq!(offset % 64, 0);
		assert!(world.publish("SessionObject", offset));
		assert_eq!(world.lookup("SessionObject"), Some(offset));
		assert_eq!(world.lookup("AppVector"), None);
		assert!(world.unpublish("SessionObject"));
		assert_eq!(world.lookup("SessionObject"), None);
	}

	#[test]
	fn test_pool_exhaustion_and_release() {
		let (local, _owner) = LocalWorld::create(1024, PROTOCOL_VERSION).unwrap();
		let world = local.world();
		assert!(world.alloc(512, 8).is_some());
		assert!(world.alloc(1024, 8).is_none());
		world.release_pool();
		assert_eq!(world.pool_used(), 0);
		assert!(world.alloc(1024, 8).is_some());
	}

	#[test]
	fn test_local_join_after_owner_drop_fails() {
		let (local, owner) = LocalWorld::create(1024, PROTOCOL_VERSION).unwrap();
		let joiner = local.join(PROTOCOL_VERSION).unwrap();
		assert_eq!(joiner.identity(), FIRST_JOINER_IDENTITY);
		drop(owner);
		assert!(matches!(local.join(PROTOCOL_VERSION), Err(ConnectError::NotRunning(_))));
	}
}
