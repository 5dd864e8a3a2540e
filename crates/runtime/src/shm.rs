//! Mapped segments and the cross-process lock that lives inside them.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::process::{current_pid, pid_is_alive};

/// A `MAP_SHARED` mapping, either backed by a POSIX shared-memory object or
/// anonymous (shared only with threads of this process and its children).
///
/// The mapping is released on drop; the named object outlives it until
/// [`Segment::unlink`] is called.
pub struct Segment {
	ptr: NonNull<u8>,
	len: usize,
	name: Option<String>,
}

// SAFETY: the mapping is plain memory; all shared structures placed in it
// synchronize through atomics or a `ShmLock`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
	/// Creates and maps a new named object of `len` zeroed bytes.
	///
	/// Fails with [`io::ErrorKind::AlreadyExists`] if the name is taken.
	pub fn create(name: &str, len: usize) -> io::Result<Self> {
		let cname = shm_name(name)?;
		// SAFETY: cname is a valid NUL-terminated string.
		let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600 as libc::mode_t) };
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}
		// SAFETY: fd was just returned by shm_open and is owned by nobody else.
		let fd = unsafe { OwnedFd::from_raw_fd(fd) };

		// SAFETY: fd is a valid shared-memory descriptor.
		if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
			let err = io::Error::last_os_error();
			let _ = Self::unlink(name);
			return Err(err);
		}

		match Self::map(Some(&fd), len) {
			Ok(ptr) => Ok(Self {
				ptr,
				len,
				name: Some(name.to_string()),
			}),
			Err(err) => {
				let _ = Self::unlink(name);
				Err(err)
			}
		}
	}

	/// Maps an existing named object at its full size.
	pub fn open(name: &str) -> io::Result<Self> {
		let cname = shm_name(name)?;
		// SAFETY: cname is a valid NUL-terminated string.
		let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0 as libc::mode_t) };
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}
		// SAFETY: fd was just returned by shm_open.
		let fd = unsafe { OwnedFd::from_raw_fd(fd) };

		// SAFETY: stat is plain old data and fully written by fstat on success.
		let mut stat: libc::stat = unsafe { std::mem::zeroed() };
		if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
			return Err(io::Error::last_os_error());
		}
		let len = usize::try_from(stat.st_size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative segment size"))?;
		if len == 0 {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "segment has no size yet"));
		}

		let ptr = Self::map(Some(&fd), len)?;
		Ok(Self {
			ptr,
			len,
			name: Some(name.to_string()),
		})
	}

	/// Maps `len` zeroed bytes not reachable by name.
	pub fn anonymous(len: usize) -> io::Result<Self> {
		let ptr = Self::map(None, len)?;
		Ok(Self { ptr, len, name: None })
	}

	/// Removes a named object. Existing mappings stay valid.
	pub fn unlink(name: &str) -> io::Result<()> {
		let cname = shm_name(name)?;
		// SAFETY: cname is a valid NUL-terminated string.
		if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(())
	}

	fn map(fd: Option<&OwnedFd>, len: usize) -> io::Result<NonNull<u8>> {
		if len == 0 {
			return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty segment"));
		}
		let (flags, raw_fd) = match fd {
			Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
			None => (libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1),
		};
		// SAFETY: requesting a fresh mapping; the kernel picks the address.
		let addr = unsafe { libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, flags, raw_fd, 0) };
		if addr == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}
		NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Reference to a `T` placed at `offset`.
	///
	/// # Safety
	///
	/// `T` must be valid for any bit pattern (atomics, integers, byte arrays,
	/// `UnsafeCell`s of those), and `offset..offset + size_of::<T>()` must be
	/// inside the mapping and aligned for `T`.
	pub(crate) unsafe fn at<T>(&self, offset: usize) -> &T {
		debug_assert!(offset + std::mem::size_of::<T>() <= self.len, "offset {offset} out of bounds");
		debug_assert_eq!(offset % std::mem::align_of::<T>(), 0, "misaligned offset {offset}");
		// SAFETY: upheld by the caller.
		unsafe { &*self.ptr.as_ptr().add(offset).cast::<T>() }
	}

	/// Raw pointer to the byte at `offset`.
	pub(crate) fn byte_ptr(&self, offset: usize) -> *mut u8 {
		debug_assert!(offset <= self.len);
		// SAFETY: offset is inside the mapping.
		unsafe { self.ptr.as_ptr().add(offset) }
	}
}

impl Drop for Segment {
	fn drop(&mut self) {
		// SAFETY: ptr/len describe a mapping created by `map` and not yet released.
		unsafe {
			libc::munmap(self.ptr.as_ptr().cast(), self.len);
		}
	}
}

impl std::fmt::Debug for Segment {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Segment").field("name", &self.name).field("len", &self.len).finish()
	}
}

fn shm_name(name: &str) -> io::Result<CString> {
	CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid segment name {name:?}")))
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
	(value + align - 1) & !(align - 1)
}

/// A spin lock usable across processes.
///
/// The word holds `0` when free or the pid of the holder. A holder whose
/// process has died is detected by waiters and its lock is taken over, so a
/// crashed application never wedges the registry.
///
/// Not reentrant: locking twice from one thread deadlocks.
#[repr(C)]
#[derive(Default)]
pub struct ShmLock {
	holder: AtomicU32,
}

const STALL_WARNING: Duration = Duration::from_secs(5);

impl ShmLock {
	pub fn lock(&self) -> ShmLockGuard<'_> {
		let me = current_pid();
		let started = Instant::now();
		let mut warned = false;
		let mut attempt: u32 = 0;

		loop {
			let holder = match self.holder.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
				Ok(_) => return ShmLockGuard { lock: self },
				Err(holder) => holder,
			};

			if attempt % 64 == 63 && holder != me && !pid_is_alive(holder) && self.holder.compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed).is_ok() {
				warn!(target = "maestro.shm", holder, "reclaimed lock from dead process");
				return ShmLockGuard { lock: self };
			}

			if !warned && started.elapsed() > STALL_WARNING {
				warn!(target = "maestro.shm", holder, "still waiting for shared lock");
				warned = true;
			}

			backoff(attempt);
			attempt = attempt.saturating_add(1);
		}
	}

	pub fn try_lock(&self) -> Option<ShmLockGuard<'_>> {
		self.holder
			.compare_exchange(0, current_pid(), Ordering::Acquire, Ordering::Relaxed)
			.ok()
			.map(|_| ShmLockGuard { lock: self })
	}

	/// Pid of the current holder, `0` when free.
	pub fn holder(&self) -> u32 {
		self.holder.load(Ordering::Relaxed)
	}
}

fn backoff(attempt: u32) {
	match attempt {
		0..16 => std::hint::spin_loop(),
		16..32 => std::thread::yield_now(),
		_ => std::thread::sleep(Duration::from_micros(50 << (attempt - 32).min(4))),
	}
}

pub struct ShmLockGuard<'a> {
	lock: &'a ShmLock,
}

impl Drop for ShmLockGuard<'_> {
	fn drop(&mut self) {
		self.lock.holder.store(0, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::AtomicU64;

	use super::*;

	#[test]
	fn anonymous_segment_is_zeroed() {
		let seg = Segment::anonymous(4096).unwrap();
		let word: &AtomicU64 = unsafe { seg.at(128) };
		assert_eq!(word.load(Ordering::Relaxed), 0);
		assert!(seg.name().is_none());
	}

	#[test]
	fn named_segment_is_shared_between_mappings() {
		let name = format!("/maestro-shm-test-{}", current_pid());
		let _ = Segment::unlink(&name);
		let a = Segment::create(&name, 8192).unwrap();
		let b = Segment::open(&name).unwrap();
		assert_eq!(b.len(), 8192);

		unsafe { a.at::<AtomicU64>(64) }.store(42, Ordering::Release);
		assert_eq!(unsafe { b.at::<AtomicU64>(64) }.load(Ordering::Acquire), 42);

		let err = Segment::create(&name, 8192).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
		Segment::unlink(&name).unwrap();
		assert!(Segment::open(&name).is_err());
	}

	#[test]
	fn lock_excludes_other_threads() {
		let seg = Arc::new(Segment::anonymous(4096).unwrap());
		let mut handles = Vec::new();
		for _ in 0..4 {
			let seg = seg.clone();
			handles.push(std::thread::spawn(move || {
				let lock: &ShmLock = unsafe { seg.at(0) };
				let counter: &AtomicU64 = unsafe { seg.at(8) };
				for _ in 0..500 {
					let _guard = lock.lock();
					let v = counter.load(Ordering::Relaxed);
					counter.store(v + 1, Ordering::Relaxed);
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(unsafe { seg.at::<AtomicU64>(8) }.load(Ordering::Relaxed), 2000);
	}

	#[test]
	fn lock_held_by_dead_process_is_reclaimed() {
		let mut child = std::process::Command::new("true").spawn().unwrap();
		let dead = child.id();
		child.wait().unwrap();

		let lock = ShmLock::default();
		lock.holder.store(dead, Ordering::Relaxed);
		assert!(lock.try_lock().is_none());
		let guard = lock.lock();
		assert_eq!(lock.holder(), current_pid());
		drop(guard);
		assert_eq!(lock.holder(), 0);
	}

	#[test]
	fn align_up_rounds() {
		assert_eq!(align_up(0, 64), 0);
		assert_eq!(align_up(1, 64), 64);
		assert_eq!(align_up(128, 64), 128);
	}
}
