//! A single shard of the bounded buffer.
//!
//! A shard is a fixed-capacity ring guarded by one `parking_lot::Mutex` and
//! two counting semaphores:
//!
//! - `free` counts empty slots (starts at capacity) and is what producers
//!   wait on.
//! - `occupied` counts filled slots (starts at zero) and is what consumers
//!   wait on.
//!
//! A producer takes a `free` permit, writes under the lock, then posts
//! `occupied`. A consumer does the mirror image. The lock is only ever held
//! for a slot write or read, a cursor step and a tally increment; it is never
//! held while waiting on a semaphore.

use std::fmt;
use std::mem;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::coord::Semaphore;
use crate::error::ShardError;
use crate::tally::{Item, ItemTally};
use crate::worker::Role;

/// State protected by the shard lock.
struct Ring<T: Item> {
  slots: Box<[Option<T>]>,
  /// Next slot to write.
  write_cursor: usize,
  /// Next slot to read.
  read_cursor: usize,
  enqueued: u64,
  dequeued: u64,
  tally: ItemTally<T>,
}

impl<T: Item> Ring<T> {
  fn new(capacity: usize) -> Self {
    Self {
      slots: (0..capacity).map(|_| None).collect(),
      write_cursor: 0,
      read_cursor: 0,
      enqueued: 0,
      dequeued: 0,
      tally: ItemTally::new(),
    }
  }

  #[inline]
  fn step(&self, cursor: usize) -> usize {
    (cursor + 1) % self.slots.len()
  }

  fn put(&mut self, value: T) {
    let cursor = self.write_cursor;
    debug_assert!(
      self.slots[cursor].is_none(),
      "write cursor overran an occupied slot"
    );
    self.tally.record_produced(&value);
    self.slots[cursor] = Some(value);
    self.write_cursor = self.step(cursor);
    self.enqueued += 1;
  }

  fn take(&mut self, shard: usize) -> Result<T, ShardError> {
    let cursor = self.read_cursor;
    let value = self.slots[cursor]
      .take()
      .ok_or(ShardError::CorruptSlot { shard, cursor })?;
    self.tally.record_consumed(&value);
    self.read_cursor = self.step(cursor);
    self.dequeued += 1;
    Ok(value)
  }
}

/// A point-in-time view of a shard's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
  pub id: usize,
  pub capacity: usize,
  /// Permits currently held by the `occupied` semaphore.
  pub occupied: usize,
  /// Permits currently held by the `free` semaphore.
  pub free: usize,
  /// Items physically sitting in the ring.
  pub len: usize,
  pub write_cursor: usize,
  pub read_cursor: usize,
  pub enqueued: u64,
  pub dequeued: u64,
}

impl ShardStats {
  /// `occupied + free == capacity`.
  ///
  /// Holds whenever no enqueue or dequeue sits between its semaphore wait and
  /// its semaphore post, e.g. after all workers have joined or while every
  /// worker is blocked.
  pub fn is_conserved(&self) -> bool {
    self.occupied + self.free == self.capacity
  }
}

/// One independently synchronized partition of the bounded buffer.
pub struct Shard<T: Item> {
  id: usize,
  capacity: usize,
  ring: Mutex<Ring<T>>,
  occupied: Semaphore,
  free: Semaphore,
}

impl<T: Item> fmt::Debug for Shard<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Shard")
      .field("id", &self.id)
      .field("capacity", &self.capacity)
      .field("occupied", &self.occupied)
      .field("free", &self.free)
      .finish()
  }
}

impl<T: Item> Shard<T> {
  /// Creates an empty shard: `free = capacity`, `occupied = 0`.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` is 0.
  pub fn new(id: usize, capacity: usize) -> Self {
    assert!(capacity > 0, "shard capacity must be at least 1");
    Self {
      id,
      capacity,
      ring: Mutex::new(Ring::new(capacity)),
      occupied: Semaphore::new(0, capacity),
      free: Semaphore::new(capacity, capacity),
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Items currently in the ring.
  pub fn len(&self) -> usize {
    let ring = self.ring.lock();
    (ring.enqueued - ring.dequeued) as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[inline]
  fn write(&self, value: T) {
    self.ring.lock().put(value);
    self.occupied.release();
  }

  #[inline]
  fn read(&self) -> Result<T, ShardError> {
    let value = self.ring.lock().take(self.id)?;
    self.free.release();
    Ok(value)
  }

  /// Enqueues `value`, blocking while the shard is full.
  ///
  /// # Errors
  ///
  /// `ShardError::Closed` if the shard is closed before a slot frees up.
  pub fn enqueue(&self, value: T) -> Result<(), ShardError> {
    self
      .free
      .acquire()
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Producer))?;
    self.write(value);
    Ok(())
  }

  /// Dequeues the oldest value, blocking while the shard is empty.
  ///
  /// # Errors
  ///
  /// - `ShardError::Closed` if the shard is closed before an item arrives.
  /// - `ShardError::CorruptSlot` if the slot accounting is broken.
  pub fn dequeue(&self) -> Result<T, ShardError> {
    self
      .occupied
      .acquire()
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Consumer))?;
    self.read()
  }

  /// Enqueues without blocking; `ShardError::Full` if no slot is free.
  pub fn try_enqueue(&self, value: T) -> Result<(), ShardError> {
    self
      .free
      .try_acquire()
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Producer))?;
    self.write(value);
    Ok(())
  }

  /// Dequeues without blocking; `ShardError::Empty` if nothing is queued.
  pub fn try_dequeue(&self) -> Result<T, ShardError> {
    self
      .occupied
      .try_acquire()
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Consumer))?;
    self.read()
  }

  /// Like [`enqueue`](Self::enqueue), failing with `ShardError::Timeout`
  /// after `timeout`.
  pub fn enqueue_timeout(&self, value: T, timeout: Duration) -> Result<(), ShardError> {
    self
      .free
      .acquire_timeout(timeout)
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Producer))?;
    self.write(value);
    Ok(())
  }

  /// Like [`dequeue`](Self::dequeue), failing with `ShardError::Timeout`
  /// after `timeout`.
  pub fn dequeue_timeout(&self, timeout: Duration) -> Result<T, ShardError> {
    self
      .occupied
      .acquire_timeout(timeout)
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Consumer))?;
    self.read()
  }

  /// Asynchronous [`enqueue`](Self::enqueue). The task, not the thread,
  /// waits for a free slot.
  pub async fn enqueue_async(&self, value: T) -> Result<(), ShardError> {
    self
      .free
      .acquire_async()
      .await
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Producer))?;
    self.write(value);
    Ok(())
  }

  /// Asynchronous [`dequeue`](Self::dequeue).
  pub async fn dequeue_async(&self) -> Result<T, ShardError> {
    self
      .occupied
      .acquire_async()
      .await
      .map_err(|e| ShardError::from_semaphore(self.id, e, Role::Consumer))?;
    self.read()
  }

  /// Closes both semaphores. Every blocked producer and consumer wakes with
  /// `ShardError::Closed`; items still in the ring stay where they are.
  ///
  /// Returns `false` if the shard was already closed.
  pub fn close(&self) -> bool {
    let free_closed = self.free.close();
    let occupied_closed = self.occupied.close();
    let newly = free_closed || occupied_closed;
    if newly {
      debug!(shard = self.id, "shard closed");
    }
    newly
  }

  pub fn is_closed(&self) -> bool {
    self.free.is_closed()
  }

  /// Threads and tasks currently blocked on this shard, as
  /// `(producers, consumers)`.
  pub fn blocked(&self) -> (usize, usize) {
    (self.free.waiting(), self.occupied.waiting())
  }

  pub fn stats(&self) -> ShardStats {
    let ring = self.ring.lock();
    ShardStats {
      id: self.id,
      capacity: self.capacity,
      occupied: self.occupied.available(),
      free: self.free.available(),
      len: (ring.enqueued - ring.dequeued) as usize,
      write_cursor: ring.write_cursor,
      read_cursor: ring.read_cursor,
      enqueued: ring.enqueued,
      dequeued: ring.dequeued,
    }
  }

  /// Moves this shard's partial tally out, leaving an empty one behind.
  pub fn take_tally(&self) -> ItemTally<T> {
    mem::take(&mut self.ring.lock().tally)
  }
}

#[cfg(test)]
mod tests;
