//! Publish/subscribe over shared memory.
//!
//! The bus is a fixed set of rings. A ring is bound to a channel key the
//! first time somebody subscribes to that channel; per-application channels
//! are unbound again once their last reader goes away. Each ring keeps a
//! cursor per reader, so a message is retained until the slowest live reader
//! has seen it and every reader observes its channel in posting order.
//!
//! Delivery is at-most-once: a post to a channel nobody reads is discarded,
//! and a reader only sees messages posted after it subscribed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use maestro_protocol::{Channel, MESSAGE_WORDS, Message};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::process::{current_pid, pid_is_alive};
use crate::shm::{Segment, ShmLock, align_up};
use crate::world::World;

/// Readers that may follow one channel at the same time.
pub const READERS_PER_CHANNEL: usize = 16;

#[repr(C)]
struct BusHeader {
	bind_lock: ShmLock,
	closed: AtomicU32,
	channels: AtomicU32,
	depth: AtomicU32,
	posted: AtomicU64,
	discarded: AtomicU64,
}

#[repr(C)]
struct ReaderSlot {
	pid: AtomicU32,
	active: AtomicU32,
	cursor: AtomicU64,
}

/// `bound` holds the channel key plus one; zero means free.
#[repr(C)]
struct RingHeader {
	bound: AtomicU32,
	write_lock: ShmLock,
	head: AtomicU64,
	readers: [ReaderSlot; READERS_PER_CHANNEL],
}

/// `seq` is the head value after this cell was written.
#[repr(C)]
struct Cell {
	seq: AtomicU64,
	words: [AtomicU32; MESSAGE_WORDS],
}

const RINGS_OFFSET: usize = align_up(std::mem::size_of::<BusHeader>(), 8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostError {
	#[error("channel {channel} is full ({depth} messages pending)")]
	BusFull { channel: Channel, depth: usize },

	#[error("bus has been detached")]
	Detached,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
	#[error("no free ring for channel {0}")]
	NoFreeChannel(Channel),

	#[error("channel {0} already has the maximum number of readers")]
	TooManyReaders(Channel),

	#[error("bus has been detached")]
	Detached,
}

fn bound_key(channel: Channel) -> u32 {
	channel.key().wrapping_add(1)
}

/// View of the bus inside a mapped world.
#[derive(Clone, Debug)]
pub struct Bus {
	segment: Arc<Segment>,
	offset: usize,
}

impl Bus {
	fn layout_size(channels: usize, depth: usize) -> Option<usize> {
		u32::try_from(channels).ok()?;
		u32::try_from(depth).ok()?;
		let ring = depth.checked_mul(std::mem::size_of::<Cell>())?.checked_add(std::mem::size_of::<RingHeader>())?;
		let stride = ring.checked_add(7)? & !7;
		channels.checked_mul(stride)?.checked_add(RINGS_OFFSET)
	}

	fn ring_stride(depth: usize) -> usize {
		align_up(std::mem::size_of::<RingHeader>() + depth * std::mem::size_of::<Cell>(), 8)
	}

	/// Allocates `channels` rings of `depth` cells each from the world pool.
	pub(crate) fn create(world: &World, channels: usize, depth: usize) -> Option<Self> {
		let depth = depth.max(1);
		let offset = world.alloc(Self::layout_size(channels, depth)?, 8)?;
		let bus = Self::open(world.segment().clone(), offset);
		bus.header().depth.store(depth as u32, Ordering::Relaxed);
		bus.header().channels.store(channels as u32, Ordering::Release);
		Some(bus)
	}

	pub(crate) fn open(segment: Arc<Segment>, offset: usize) -> Self {
		Self { segment, offset }
	}

	pub(crate) fn offset(&self) -> usize {
		self.offset
	}

	fn header(&self) -> &BusHeader {
		// SAFETY: offset was produced by `create`; the header is plain atomics.
		unsafe { self.segment.at(self.offset) }
	}

	fn depth(&self) -> usize {
		self.header().depth.load(Ordering::Relaxed) as usize
	}

	fn channel_count(&self) -> usize {
		self.header().channels.load(Ordering::Acquire) as usize
	}

	fn ring(&self, index: usize) -> &RingHeader {
		debug_assert!(index < self.channel_count());
		// SAFETY: index is below the ring count this bus was allocated with.
		unsafe { self.segment.at(self.offset + RINGS_OFFSET + index * Self::ring_stride(self.depth())) }
	}

	fn cell(&self, ring: usize, seq: u64) -> &Cell {
		let depth = self.depth();
		let base = self.offset + RINGS_OFFSET + ring * Self::ring_stride(depth) + std::mem::size_of::<RingHeader>();
		// SAFETY: the cell index is reduced modulo the ring depth.
		unsafe { self.segment.at(base + (seq as usize % depth) * std::mem::size_of::<Cell>()) }
	}

	fn find_ring(&self, key: u32) -> Option<usize> {
		(0..self.channel_count()).find(|&i| self.ring(i).bound.load(Ordering::Acquire) == key)
	}

	fn is_closed(&self) -> bool {
		self.header().closed.load(Ordering::Acquire) != 0
	}

	/// Messages accepted onto a ring so far.
	pub fn posted(&self) -> u64 {
		self.header().posted.load(Ordering::Relaxed)
	}

	/// Messages dropped because nobody was reading their channel.
	pub fn discarded(&self) -> u64 {
		self.header().discarded.load(Ordering::Relaxed)
	}

	/// Live readers currently following `channel`.
	pub fn readers(&self, channel: Channel) -> usize {
		self.find_ring(bound_key(channel))
			.map(|i| self.ring(i).readers.iter().filter(|r| is_live(r)).count())
			.unwrap_or(0)
	}

	/// Unbinds a per-application channel whose readers have all died.
	///
	/// Returns `true` if the ring was freed. Channels with a live reader and
	/// the fixed channels are left alone.
	pub fn release(&self, channel: Channel) -> bool {
		if !channel.is_per_app() {
			return false;
		}
		let _bind = self.header().bind_lock.lock();
		match self.find_ring(bound_key(channel)) {
			Some(index) => self.reclaim(index),
			None => false,
		}
	}

	/// Frees ring `index` if it serves a per-application channel with no live
	/// reader. Callers hold the bind lock.
	fn reclaim(&self, index: usize) -> bool {
		let ring = self.ring(index);
		let _guard = ring.write_lock.lock();
		let bound = ring.bound.load(Ordering::Acquire);
		if bound == 0 {
			return true;
		}
		let channel = Channel::from_key(bound.wrapping_sub(1));
		if !channel.is_per_app() {
			return false;
		}
		evict_dead_readers(ring, channel);
		if slowest_cursor(ring).is_some() {
			return false;
		}
		ring.bound.store(0, Ordering::Release);
		debug!(target = "maestro.bus", %channel, ring = index, "reclaimed ring of dead readers");
		true
	}

	/// Copies `message` onto `channel` without waiting for any reader.
	pub fn post(&self, channel: Channel, message: Message) -> Result<(), PostError> {
		if self.is_closed() {
			return Err(PostError::Detached);
		}

		let key = bound_key(channel);
		let Some(index) = self.find_ring(key) else {
			self.discard(channel, &message);
			return Ok(());
		};

		let ring = self.ring(index);
		let _guard = ring.write_lock.lock();
		if ring.bound.load(Ordering::Acquire) != key {
			self.discard(channel, &message);
			return Ok(());
		}

		let head = ring.head.load(Ordering::Relaxed);
		let depth = self.depth() as u64;
		let Some(mut slowest) = slowest_cursor(ring) else {
			self.discard(channel, &message);
			return Ok(());
		};

		if head - slowest >= depth {
			evict_dead_readers(ring, channel);
			match slowest_cursor(ring) {
				None => {
					self.discard(channel, &message);
					return Ok(());
				}
				Some(cursor) => slowest = cursor,
			}
			if head - slowest >= depth {
				return Err(PostError::BusFull {
					channel,
					depth: depth as usize,
				});
			}
		}

		let cell = self.cell(index, head);
		for (slot, word) in cell.words.iter().zip(message.encode()) {
			slot.store(word, Ordering::Relaxed);
		}
		cell.seq.store(head + 1, Ordering::Release);
		ring.head.store(head + 1, Ordering::Release);
		self.header().posted.fetch_add(1, Ordering::Relaxed);
		trace!(target = "maestro.bus", %channel, %message, seq = head, "posted");
		Ok(())
	}

	fn discard(&self, channel: Channel, message: &Message) {
		self.header().discarded.fetch_add(1, Ordering::Relaxed);
		trace!(target = "maestro.bus", %channel, %message, "no reader, message discarded");
	}

	/// Starts following `channel`; `handler` sees every message posted from
	/// now on, in order, each time the subscription is pumped.
	pub fn subscribe<F>(&self, channel: Channel, handler: F) -> Result<Subscription, SubscribeError>
	where
		F: FnMut(Message) + Send + 'static,
	{
		if self.is_closed() {
			return Err(SubscribeError::Detached);
		}

		let key = bound_key(channel);
		let _bind = self.header().bind_lock.lock();
		let index = match self.find_ring(key) {
			Some(index) => index,
			None => {
				let index = self
					.find_ring(0)
					.or_else(|| (0..self.channel_count()).find(|&i| self.reclaim(i)))
					.ok_or(SubscribeError::NoFreeChannel(channel))?;
				let ring = self.ring(index);
				let _guard = ring.write_lock.lock();
				for reader in &ring.readers {
					reader.active.store(0, Ordering::Release);
				}
				ring.bound.store(key, Ordering::Release);
				debug!(target = "maestro.bus", %channel, ring = index, "bound channel");
				index
			}
		};

		let ring = self.ring(index);
		let _guard = ring.write_lock.lock();
		let slot = ring
			.readers
			.iter()
			.position(|r| r.active.load(Ordering::Acquire) == 0 || !pid_is_alive(r.pid.load(Ordering::Relaxed)))
			.ok_or(SubscribeError::TooManyReaders(channel))?;

		let reader = &ring.readers[slot];
		reader.pid.store(current_pid(), Ordering::Relaxed);
		reader.cursor.store(ring.head.load(Ordering::Acquire), Ordering::Relaxed);
		reader.active.store(1, Ordering::Release);
		debug!(target = "maestro.bus", %channel, ring = index, slot, "subscribed");

		Ok(Subscription {
			bus: self.clone(),
			ring: index,
			slot,
			channel,
			handler: Box::new(handler),
		})
	}

	/// Unbinds every ring and refuses further traffic.
	pub(crate) fn detach(&self) -> usize {
		self.header().closed.store(1, Ordering::Release);
		let _bind = self.header().bind_lock.lock();
		let mut unbound = 0;
		for index in 0..self.channel_count() {
			let ring = self.ring(index);
			let _guard = ring.write_lock.lock();
			for reader in &ring.readers {
				reader.active.store(0, Ordering::Release);
			}
			if ring.bound.swap(0, Ordering::AcqRel) != 0 {
				unbound += 1;
			}
		}
		unbound
	}
}

fn slowest_cursor(ring: &RingHeader) -> Option<u64> {
	ring.readers
		.iter()
		.filter(|r| r.active.load(Ordering::Acquire) != 0)
		.map(|r| r.cursor.load(Ordering::Acquire))
		.min()
}

fn is_live(reader: &ReaderSlot) -> bool {
	reader.active.load(Ordering::Acquire) != 0 && pid_is_alive(reader.pid.load(Ordering::Relaxed))
}

fn evict_dead_readers(ring: &RingHeader, channel: Channel) {
	for reader in &ring.readers {
		let pid = reader.pid.load(Ordering::Relaxed);
		if reader.active.load(Ordering::Acquire) != 0 && !pid_is_alive(pid) {
			reader.active.store(0, Ordering::Release);
			warn!(target = "maestro.bus", %channel, pid, "evicted reader of dead process");
		}
	}
}

/// One reader's position on one channel.
///
/// Dropping it stops following the channel.
pub struct Subscription {
	bus: Bus,
	ring: usize,
	slot: usize,
	channel: Channel,
	handler: Box<dyn FnMut(Message) + Send>,
}

impl Subscription {
	pub fn channel(&self) -> Channel {
		self.channel
	}

	/// Delivers every pending message to the handler; returns how many.
	pub fn pump(&mut self) -> usize {
		let ring = self.bus.ring(self.ring);
		let reader = &ring.readers[self.slot];
		if reader.active.load(Ordering::Acquire) == 0 || ring.bound.load(Ordering::Acquire) != bound_key(self.channel) {
			return 0;
		}

		let head = ring.head.load(Ordering::Acquire);
		let mut cursor = reader.cursor.load(Ordering::Relaxed);
		let mut delivered = 0;
		while cursor < head {
			let cell = self.bus.cell(self.ring, cursor);
			if cell.seq.load(Ordering::Acquire) != cursor + 1 {
				warn!(target = "maestro.bus", channel = %self.channel, cursor, head, "reader was overtaken, skipping ahead");
				cursor = head;
				reader.cursor.store(cursor, Ordering::Release);
				break;
			}

			let mut words = [0u32; MESSAGE_WORDS];
			for (word, slot) in words.iter_mut().zip(&cell.words) {
				*word = slot.load(Ordering::Relaxed);
			}
			cursor += 1;
			reader.cursor.store(cursor, Ordering::Release);

			match Message::decode(words) {
				Ok(message) => {
					(self.handler)(message);
					delivered += 1;
				}
				Err(err) => warn!(target = "maestro.bus", channel = %self.channel, error = %err, "dropping malformed message"),
			}
		}
		delivered
	}

	/// Pumps on a tokio task every `interval` until the returned task is dropped.
	pub fn spawn(mut self, interval: Duration) -> SubscriptionTask {
		let channel = self.channel;
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				self.pump();
			}
		});
		SubscriptionTask { channel, handle }
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let _bind = self.bus.header().bind_lock.lock();
		let ring = self.bus.ring(self.ring);
		let _guard = ring.write_lock.lock();
		ring.readers[self.slot].active.store(0, Ordering::Release);

		let key = bound_key(self.channel);
		if self.channel.is_per_app() && ring.bound.load(Ordering::Acquire) == key && slowest_cursor(ring).is_none() {
			ring.bound.store(0, Ordering::Release);
			debug!(target = "maestro.bus", channel = %self.channel, ring = self.ring, "unbound channel");
		}
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("channel", &self.channel)
			.field("ring", &self.ring)
			.field("slot", &self.slot)
			.finish()
	}
}

/// A subscription being pumped in the background. Aborted on drop.
#[derive(Debug)]
pub struct SubscriptionTask {
	channel: Channel,
	handle: JoinHandle<()>,
}

impl SubscriptionTask {
	pub fn channel(&self) -> Channel {
		self.channel
	}
}

impl Drop for SubscriptionTask {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use maestro_protocol::{AppState, MessageType, PROTOCOL_VERSION};
	use parking_lot::Mutex;

	use super::*;
	use crate::world::{Connection, LocalWorld};

	fn bus(channels: usize, depth: usize) -> (LocalWorld, Connection, Bus) {
		let (local, owner) = LocalWorld::create(256 * 1024, PROTOCOL_VERSION).unwrap();
		let bus = Bus::create(local.world(), channels, depth).unwrap();
		(local, owner, bus)
	}

	fn collector() -> (Arc<Mutex<Vec<Message>>>, impl FnMut(Message) + Send + 'static) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		(seen, move |m| sink.lock().push(m))
	}

	fn note(sender: u32, target: u32) -> Message {
		Message::new(sender, MessageType::Notification, AppState::Ready).with_target(target)
	}

	#[test]
	fn oversized_bus_is_refused() {
		let (w, _o, _bus) = bus(1, 1);
		assert!(Bus::create(w.world(), usize::MAX / 2, 64).is_none());
		assert!(Bus::create(w.world(), 4, usize::MAX / 8).is_none());
	}

	#[test]
	fn post_without_reader_is_discarded() {
		let (_w, _o, bus) = bus(4, 8);
		assert_eq!(bus.post(Channel::Owner, note(2, 0)), Ok(()));
		assert_eq!(bus.discarded(), 1);
		assert_eq!(bus.posted(), 0);
	}

	#[test]
	fn burst_arrives_in_posting_order() {
		let (_w, _o, bus) = bus(4, 64);
		let (seen, handler) = collector();
		let mut sub = bus.subscribe(Channel::Owner, handler).unwrap();
		for seq in 0..50 {
			bus.post(Channel::Owner, note(2, seq)).unwrap();
		}
		assert_eq!(sub.pump(), 50);
		let targets: Vec<u32> = seen.lock().iter().map(|m| m.target).collect();
		assert_eq!(targets, (0..50).collect::<Vec<_>>());
	}

	#[test]
	fn broadcast_reaches_every_reader() {
		let (_w, _o, bus) = bus(4, 8);
		let (a_seen, a) = collector();
		let (b_seen, b) = collector();
		let mut sub_a = bus.subscribe(Channel::Broadcast, a).unwrap();
		let mut sub_b = bus.subscribe(Channel::Broadcast, b).unwrap();
		assert_eq!(bus.readers(Channel::Broadcast), 2);

		bus.post(Channel::Broadcast, Message::new(1, MessageType::SwitchMode, AppState::Quit)).unwrap();
		sub_a.pump();
		sub_b.pump();
		assert_eq!(a_seen.lock().len(), 1);
		assert_eq!(b_seen.lock().len(), 1);
	}

	#[test]
	fn slow_reader_fills_ring() {
		let (_w, _o, bus) = bus(2, 4);
		let (_seen, handler) = collector();
		let mut sub = bus.subscribe(Channel::App(5), handler).unwrap();
		for i in 0..4 {
			bus.post(Channel::App(5), note(1, i)).unwrap();
		}
		assert_eq!(
			bus.post(Channel::App(5), note(1, 9)),
			Err(PostError::BusFull {
				channel: Channel::App(5),
				depth: 4
			})
		);
		assert_eq!(sub.pump(), 4);
		assert_eq!(bus.post(Channel::App(5), note(1, 9)), Ok(()));
	}

	#[test]
	fn late_subscriber_misses_earlier_messages() {
		let (_w, _o, bus) = bus(2, 8);
		let (_first_seen, first) = collector();
		let _first = bus.subscribe(Channel::Owner, first).unwrap();
		bus.post(Channel::Owner, note(2, 1)).unwrap();

		let (seen, late) = collector();
		let mut sub = bus.subscribe(Channel::Owner, late).unwrap();
		bus.post(Channel::Owner, note(2, 2)).unwrap();
		sub.pump();
		assert_eq!(seen.lock().iter().map(|m| m.target).collect::<Vec<_>>(), vec![2]);
	}

	#[test]
	fn dropping_last_reader_unbinds_app_channel() {
		let (_w, _o, bus) = bus(1, 4);
		let (_seen, handler) = collector();
		let sub = bus.subscribe(Channel::App(3), handler).unwrap();
		let (_seen2, other) = collector();
		assert_eq!(bus.subscribe(Channel::App(4), other).unwrap_err(), SubscribeError::NoFreeChannel(Channel::App(4)));

		drop(sub);
		assert_eq!(bus.readers(Channel::App(3)), 0);
		let (_seen3, other) = collector();
		assert!(bus.subscribe(Channel::App(4), other).is_ok());
	}

	fn dead_pid() -> u32 {
		let mut child = std::process::Command::new("true").spawn().unwrap();
		let pid = child.id();
		child.wait().unwrap();
		pid
	}

	fn orphan(bus: &Bus, channel: Channel, pid: u32) {
		let (_seen, handler) = collector();
		let sub = bus.subscribe(channel, handler).unwrap();
		bus.ring(sub.ring).readers[sub.slot].pid.store(pid, Ordering::Relaxed);
		std::mem::forget(sub);
	}

	#[test]
	fn rings_of_crashed_readers_are_reclaimed() {
		let (_w, _o, bus) = bus(2, 4);
		let dead = dead_pid();
		orphan(&bus, Channel::App(5), dead);
		orphan(&bus, Channel::App(6), dead);
		assert_eq!(bus.readers(Channel::App(5)), 0);

		let (seen, handler) = collector();
		let mut sub = bus.subscribe(Channel::App(7), handler).unwrap();
		bus.post(Channel::App(7), note(1, 7)).unwrap();
		assert_eq!(sub.pump(), 1);
		assert_eq!(seen.lock()[0].target, 7);
	}

	#[test]
	fn release_frees_only_dead_app_channels() {
		let (_w, _o, bus) = bus(3, 4);
		let (_seen, handler) = collector();
		let _live = bus.subscribe(Channel::App(3), handler).unwrap();
		orphan(&bus, Channel::App(4), dead_pid());

		assert!(!bus.release(Channel::App(3)));
		assert!(bus.release(Channel::App(4)));
		assert!(!bus.release(Channel::Owner));
		assert_eq!(bus.readers(Channel::App(3)), 1);
		assert!(bus.find_ring(bound_key(Channel::App(4))).is_none());
	}

	#[test]
	fn malformed_words_are_skipped() {
		let (_w, _o, bus) = bus(1, 4);
		let (seen, handler) = collector();
		let mut sub = bus.subscribe(Channel::Owner, handler).unwrap();
		bus.post(Channel::Owner, note(2, 1)).unwrap();
		// Corrupt the message type of the cell just written.
		bus.cell(0, 0).words[1].store(77, Ordering::Relaxed);
		bus.post(Channel::Owner, note(2, 2)).unwrap();

		assert_eq!(sub.pump(), 1);
		assert_eq!(seen.lock()[0].target, 2);
	}

	#[test]
	fn detached_bus_refuses_traffic() {
		let (_w, _o, bus) = bus(2, 4);
		let (_seen, handler) = collector();
		let mut sub = bus.subscribe(Channel::Owner, handler).unwrap();
		assert_eq!(bus.detach(), 1);
		assert_eq!(bus.post(Channel::Owner, note(2, 1)), Err(PostError::Detached));
		assert_eq!(sub.pump(), 0);
		let (_seen, handler) = collector();
		assert_eq!(bus.subscribe(Channel::Owner, handler).unwrap_err(), SubscribeError::Detached);
	}

	#[tokio::test]
	async fn test_spawned_subscription_delivers_until_dropped() {
		let (_w, _o, bus) = bus(2, 8);
		let (seen, handler) = collector();
		let task = bus.subscribe(Channel::Owner, handler).unwrap().spawn(Duration::from_millis(1));
		bus.post(Channel::Owner, note(2, 1)).unwrap();

		let delivered = crate::barrier::poll_until(500, Duration::from_millis(2), || (!seen.lock().is_empty()).then_some(())).await;
		assert!(delivered.is_ok());
		assert_eq!(task.channel(), Channel::Owner);

		drop(task);
		let unsubscribed = crate::barrier::poll_until(500, Duration::from_millis(2), || (bus.readers(Channel::Owner) == 0).then_some(())).await;
		assert!(unsubscribed.is_ok());
	}
}
