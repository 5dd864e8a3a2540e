//! Scratch buffer the on-screen keyboard hands composed text through.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::shm::{Segment, ShmLock, align_up};
use crate::world::World;

#[repr(C)]
struct OskHeader {
	lock: ShmLock,
	capacity: AtomicU32,
	len: AtomicU32,
}

const DATA_OFFSET: usize = align_up(std::mem::size_of::<OskHeader>(), 8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OskError {
	#[error("text of {len} bytes does not fit the {capacity} byte keyboard buffer")]
	TooLong { len: usize, capacity: usize },
}

#[derive(Clone, Debug)]
pub struct OskBuffer {
	segment: Arc<Segment>,
	offset: usize,
}

impl OskBuffer {
	pub(crate) fn create(world: &World, capacity: usize) -> Option<Self> {
		u32::try_from(capacity).ok()?;
		let offset = world.alloc(DATA_OFFSET.checked_add(capacity)?, 8)?;
		let buffer = Self::open(world.segment().clone(), offset);
		buffer.header().capacity.store(capacity as u32, Ordering::Release);
		Some(buffer)
	}

	pub(crate) fn open(segment: Arc<Segment>, offset: usize) -> Self {
		Self { segment, offset }
	}

	pub(crate) fn offset(&self) -> usize {
		self.offset
	}

	fn header(&self) -> &OskHeader {
		// SAFETY: offset was produced by `create`.
		unsafe { self.segment.at(self.offset) }
	}

	pub fn capacity(&self) -> usize {
		self.header().capacity.load(Ordering::Acquire) as usize
	}

	/// Replaces the buffer contents with `text`.
	pub fn write(&self, text: &str) -> Result<(), OskError> {
		let capacity = self.capacity();
		if text.len() > capacity {
			return Err(OskError::TooLong { len: text.len(), capacity });
		}
		let header = self.header();
		let _guard = header.lock.lock();
		// SAFETY: the lock is held and the range lies inside the allocation.
		unsafe { std::ptr::copy_nonoverlapping(text.as_ptr(), self.segment.byte_ptr(self.offset + DATA_OFFSET), text.len()) };
		header.len.store(text.len() as u32, Ordering::Release);
		Ok(())
	}

	pub fn read(&self) -> String {
		let header = self.header();
		let _guard = header.lock.lock();
		let len = (header.len.load(Ordering::Acquire) as usize).min(self.capacity());
		// SAFETY: the lock is held and the range lies inside the allocation.
		let bytes = unsafe { std::slice::from_raw_parts(self.segment.byte_ptr(self.offset + DATA_OFFSET), len) };
		String::from_utf8_lossy(bytes).into_owned()
	}

	pub fn clear(&self) {
		let header = self.header();
		let _guard = header.lock.lock();
		header.len.store(0, Ordering::Release);
	}
}
