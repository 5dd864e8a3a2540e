//! Bounded polling for conditions that live in shared memory.
//!
//! Another process cannot wake a tokio task, so barriers on shared state poll
//! with a fixed interval and give up after a fixed number of attempts.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("condition not met after {attempts} attempts ({waited:?})")]
pub struct PollTimeout {
	pub attempts: u32,
	pub waited: Duration,
}

/// Calls `probe` up to `limit` times, sleeping `interval` between calls,
/// and returns the first `Some` it yields.
pub async fn poll_until<T, F>(limit: u32, interval: Duration, mut probe: F) -> Result<T, PollTimeout>
where
	F: FnMut() -> Option<T>,
{
	let limit = limit.max(1);
	for attempt in 0..limit {
		if let Some(value) = probe() {
			return Ok(value);
		}
		if attempt + 1 < limit {
			tokio::time::sleep(interval).await;
		}
	}

	Err(PollTimeout {
		attempts: limit,
		waited: interval * (limit - 1),
	})
}
