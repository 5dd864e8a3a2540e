//! The application registry: a fixed table of records in shared memory.
//!
//! All access goes through one coarse [`ShmLock`] so that invariants spanning
//! several records (only one `Visible` record at a time) can be checked and
//! updated in a single critical section via [`Registry::transaction`].
//!
//! Each slot carries a generation counter. A [`RecordHandle`] names a slot and
//! the generation it was issued for, so a handle to a removed record is
//! rejected instead of silently aliasing whatever was registered next.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use maestro_protocol::{Lifecycle, Visibility};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::shm::{Segment, ShmLock, ShmLockGuard};
use crate::world::World;

pub const TITLE_CAPACITY: usize = 64;
pub const PATH_CAPACITY: usize = 256;

#[repr(C)]
struct RegistryHeader {
	lock: ShmLock,
	capacity: AtomicU32,
	len: AtomicU32,
	closed: AtomicU32,
}

#[repr(C)]
struct RecordData {
	identity: u32,
	pid: u32,
	visibility: u8,
	lifecycle: u8,
	title_len: u8,
	_reserved: u8,
	path_len: u16,
	title: [u8; TITLE_CAPACITY],
	path: [u8; PATH_CAPACITY],
}

#[repr(C)]
struct RecordSlot {
	occupied: AtomicU32,
	generation: AtomicU32,
	data: UnsafeCell<RecordData>,
}

const SLOTS_OFFSET: usize = crate::shm::align_up(std::mem::size_of::<RegistryHeader>(), 8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("registry is full ({capacity} records)")]
	Full { capacity: usize },

	#[error("identity {0} is already registered")]
	DuplicateIdentity(u32),

	#[error("record handle {0} is stale")]
	StaleHandle(RecordHandle),

	#[error("registry has been destroyed")]
	Closed,
}

/// Names one registered record for as long as it stays registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
	index: u32,
	generation: u32,
}

impl RecordHandle {
	pub fn index(&self) -> usize {
		self.index as usize
	}
}

impl std::fmt::Display for RecordHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "#{}.{}", self.index, self.generation)
	}
}

/// Owned copy of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppRecord {
	pub identity: u32,
	pub pid: u32,
	pub title: String,
	pub path: String,
	pub visibility: Visibility,
	pub lifecycle: Lifecycle,
}

impl AppRecord {
	pub fn new(identity: u32, pid: u32, title: impl Into<String>, path: impl Into<String>) -> Self {
		Self {
			identity,
			pid,
			title: title.into(),
			path: path.into(),
			visibility: Visibility::Hidden,
			lifecycle: Lifecycle::Initialising,
		}
	}

	/// Last path component of the executable.
	pub fn executable_name(&self) -> &str {
		self.path.rsplit('/').next().unwrap_or(&self.path)
	}

	pub fn is_visible(&self) -> bool {
		self.visibility.is_visible()
	}
}

/// View of the registry inside a mapped world.
#[derive(Clone, Debug)]
pub struct Registry {
	segment: Arc<Segment>,
	offset: usize,
}

impl Registry {
	fn layout_size(capacity: usize) -> Option<usize> {
		u32::try_from(capacity).ok()?;
		capacity.checked_mul(std::mem::size_of::<RecordSlot>())?.checked_add(SLOTS_OFFSET)
	}

	/// Allocates an empty registry of `capacity` slots from the world pool.
	pub(crate) fn create(world: &World, capacity: usize) -> Option<Self> {
		let offset = world.alloc(Self::layout_size(capacity)?, 8)?;
		let registry = Self::open(world.segment().clone(), offset);
		registry.header().capacity.store(capacity as u32, Ordering::Release);
		Some(registry)
	}

	pub(crate) fn open(segment: Arc<Segment>, offset: usize) -> Self {
		Self { segment, offset }
	}

	pub(crate) fn offset(&self) -> usize {
		self.offset
	}

	fn header(&self) -> &RegistryHeader {
		// SAFETY: offset was produced by `create` and the header is plain atomics.
		unsafe { self.segment.at(self.offset) }
	}

	fn slot(&self, index: usize) -> &RecordSlot {
		debug_assert!(index < self.capacity());
		// SAFETY: index is below the capacity this registry was allocated with.
		unsafe { self.segment.at(self.offset + SLOTS_OFFSET + index * std::mem::size_of::<RecordSlot>()) }
	}

	pub fn capacity(&self) -> usize {
		self.header().capacity.load(Ordering::Acquire) as usize
	}

	/// Number of records; may be stale by the time it is read.
	pub fn len(&self) -> usize {
		self.header().len.load(Ordering::Acquire) as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Runs `f` with the registry lock held.
	///
	/// `f` must not call back into this registry.
	pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Result<R, RegistryError> {
		let guard = self.header().lock.lock();
		if self.header().closed.load(Ordering::Acquire) != 0 {
			return Err(RegistryError::Closed);
		}
		let mut tx = Transaction { registry: self, _guard: guard };
		Ok(f(&mut tx))
	}

	pub fn register(&self, identity: u32, pid: u32, title: &str, path: &str) -> Result<RecordHandle, RegistryError> {
		self.transaction(|tx| tx.insert(AppRecord::new(identity, pid, title, path)))?
	}

	pub fn find_by_identity(&self, identity: u32) -> Option<RecordHandle> {
		self.find(|r| r.identity == identity).map(|(handle, _)| handle)
	}

	pub fn find_by_pid(&self, pid: u32) -> Option<RecordHandle> {
		self.find(|r| r.pid == pid).map(|(handle, _)| handle)
	}

	pub fn find(&self, pred: impl Fn(&AppRecord) -> bool) -> Option<(RecordHandle, AppRecord)> {
		self.transaction(|tx| tx.find(pred)).ok().flatten()
	}

	pub fn get(&self, handle: RecordHandle) -> Option<AppRecord> {
		self.transaction(|tx| tx.get(handle)).ok().flatten()
	}

	/// Consistent copy of every record.
	pub fn snapshot(&self) -> Vec<(RecordHandle, AppRecord)> {
		self.transaction(|tx| tx.records()).unwrap_or_default()
	}

	pub fn mutate<R>(&self, handle: RecordHandle, f: impl FnOnce(&mut AppRecord) -> R) -> Result<R, RegistryError> {
		self.transaction(|tx| tx.update(handle, f))?
	}

	pub fn remove(&self, handle: RecordHandle) -> Result<AppRecord, RegistryError> {
		self.transaction(|tx| tx.remove(handle))?
	}

	/// Removes every record matching `pred` and returns them.
	pub fn remove_where(&self, pred: impl Fn(&AppRecord) -> bool) -> Vec<AppRecord> {
		self.transaction(|tx| {
			let doomed: Vec<RecordHandle> = tx.records().into_iter().filter(|(_, r)| pred(r)).map(|(h, _)| h).collect();
			doomed.into_iter().filter_map(|h| tx.remove(h).ok()).collect()
		})
		.unwrap_or_default()
	}

	/// Drops every record and refuses further access.
	pub(crate) fn destroy(&self) -> usize {
		let _guard = self.header().lock.lock();
		let mut dropped = 0;
		for index in 0..self.capacity() {
			let slot = self.slot(index);
			if slot.occupied.swap(0, Ordering::AcqRel) != 0 {
				dropped += 1;
			}
		}
		self.header().len.store(0, Ordering::Release);
		self.header().closed.store(1, Ordering::Release);
		dropped
	}
}

/// Exclusive access to the registry for the duration of one closure.
pub struct Transaction<'a> {
	registry: &'a Registry,
	_guard: ShmLockGuard<'a>,
}

impl Transaction<'_> {
	fn live_slot(&self, handle: RecordHandle) -> Option<&RecordSlot> {
		if handle.index() >= self.registry.capacity() {
			return None;
		}
		let slot = self.registry.slot(handle.index());
		let live = slot.occupied.load(Ordering::Acquire) != 0 && slot.generation.load(Ordering::Acquire) == handle.generation;
		live.then_some(slot)
	}

	fn handle_of(&self, index: usize) -> Option<RecordHandle> {
		let slot = self.registry.slot(index);
		(slot.occupied.load(Ordering::Acquire) != 0).then(|| RecordHandle {
			index: index as u32,
			generation: slot.generation.load(Ordering::Acquire),
		})
	}

	pub fn insert(&mut self, record: AppRecord) -> Result<RecordHandle, RegistryError> {
		if self.find(|r| r.identity == record.identity).is_some() {
			return Err(RegistryError::DuplicateIdentity(record.identity));
		}
		let capacity = self.registry.capacity();
		let Some(index) = (0..capacity).find(|&i| self.registry.slot(i).occupied.load(Ordering::Acquire) == 0) else {
			warn!(target = "maestro.registry", capacity, identity = record.identity, "registry full");
			return Err(RegistryError::Full { capacity });
		};

		let slot = self.registry.slot(index);
		let generation = slot.generation.load(Ordering::Acquire).wrapping_add(1);
		// SAFETY: the registry lock is held and the slot is unoccupied.
		unsafe { store(&mut *slot.data.get(), &record) };
		slot.generation.store(generation, Ordering::Release);
		slot.occupied.store(1, Ordering::Release);
		self.registry.header().len.fetch_add(1, Ordering::AcqRel);

		let handle = RecordHandle {
			index: index as u32,
			generation,
		};
		debug!(target = "maestro.registry", %handle, identity = record.identity, pid = record.pid, title = %record.title, "registered");
		Ok(handle)
	}

	pub fn get(&self, handle: RecordHandle) -> Option<AppRecord> {
		// SAFETY: the registry lock is held.
		self.live_slot(handle).map(|slot| unsafe { load(&*slot.data.get()) })
	}

	pub fn update<R>(&mut self, handle: RecordHandle, f: impl FnOnce(&mut AppRecord) -> R) -> Result<R, RegistryError> {
		let slot = self.live_slot(handle).ok_or(RegistryError::StaleHandle(handle))?;
		// SAFETY: the registry lock is held and the slot is live.
		let data = unsafe { &mut *slot.data.get() };
		let mut record = load(data);
		let out = f(&mut record);
		store(data, &record);
		Ok(out)
	}

	pub fn remove(&mut self, handle: RecordHandle) -> Result<AppRecord, RegistryError> {
		let record = self.get(handle).ok_or(RegistryError::StaleHandle(handle))?;
		self.registry.slot(handle.index()).occupied.store(0, Ordering::Release);
		self.registry.header().len.fetch_sub(1, Ordering::AcqRel);
		debug!(target = "maestro.registry", %handle, identity = record.identity, "removed");
		Ok(record)
	}

	pub fn records(&self) -> Vec<(RecordHandle, AppRecord)> {
		(0..self.registry.capacity())
			.filter_map(|i| self.handle_of(i))
			.filter_map(|h| self.get(h).map(|r| (h, r)))
			.collect()
	}

	pub fn find(&self, pred: impl Fn(&AppRecord) -> bool) -> Option<(RecordHandle, AppRecord)> {
		self.records().into_iter().find(|(_, r)| pred(r))
	}

	pub fn len(&self) -> usize {
		self.registry.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

fn load(data: &RecordData) -> AppRecord {
	let title_len = (data.title_len as usize).min(TITLE_CAPACITY);
	let path_len = (data.path_len as usize).min(PATH_CAPACITY);
	AppRecord {
		identity: data.identity,
		pid: data.pid,
		title: String::from_utf8_lossy(&data.title[..title_len]).into_owned(),
		path: String::from_utf8_lossy(&data.path[..path_len]).into_owned(),
		visibility: Visibility::from_raw(data.visibility),
		lifecycle: Lifecycle::from_raw(data.lifecycle),
	}
}

fn store(data: &mut RecordData, record: &AppRecord) {
	data.identity = record.identity;
	data.pid = record.pid;
	data.visibility = record.visibility.to_raw();
	data.lifecycle = record.lifecycle.to_raw();
	data.title_len = copy_truncated(&mut data.title, &record.title) as u8;
	data.path_len = copy_truncated(&mut data.path, &record.path) as u16;
}

/// Copies as much of `text` as fits, cutting on a char boundary.
fn copy_truncated(dst: &mut [u8], text: &str) -> usize {
	let mut len = text.len().min(dst.len());
	while !text.is_char_boundary(len) {
		len -= 1;
	}
	dst[..len].copy_from_slice(&text.as_bytes()[..len]);
	len
}
