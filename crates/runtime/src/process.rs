//! Process liveness helpers shared by the lock, bus and launcher.

use std::io;

/// Returns `true` when a process with `pid` appears alive on this host.
///
/// A process owned by another user still counts as alive.
pub fn pid_is_alive(pid: u32) -> bool {
	if pid == 0 || pid > i32::MAX as u32 {
		return false;
	}

	// SAFETY: signal 0 only performs the permission and existence check.
	let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
	if rc == 0 {
		return true;
	}

	io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Pid of the calling process.
pub fn current_pid() -> u32 {
	std::process::id()
}

/// Asks `pid` to exit with `SIGTERM`.
pub fn terminate(pid: u32) -> io::Result<()> {
	if pid == 0 || pid > i32::MAX as u32 {
		return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")));
	}

	// SAFETY: plain syscall with validated arguments.
	let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
	if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Seconds since the unix epoch, `0` if the clock is before it.
pub fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}
