//! A counting semaphore that supports both synchronous and asynchronous waiters.
//!
//! Each shard owns two of these: one counting free slots and one counting
//! occupied slots. The permit count and the unified waiter queue (sync
//! `Thread`s and async `Waker`s) live behind one `parking_lot::Mutex`, so
//! waking and permit transfer cannot race into lost wakeups.
//!
//! Permits are handed off: `release` with a non-empty queue grants the permit
//! directly to the oldest waiter instead of bumping the counter. A fresh
//! arrival can therefore never steal a permit from someone already queued,
//! and `permits > 0` implies the queue is empty.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::SemaphoreError;
use crate::sync_util;

/// Marks whether a queued waiter has been handed a permit.
/// Only written while the semaphore mutex is held.
#[derive(Debug, Default)]
struct Ticket {
  granted: AtomicBool,
}

impl Ticket {
  fn grant(&self) {
    self.granted.store(true, Ordering::Relaxed);
  }

  fn is_granted(&self) -> bool {
    self.granted.load(Ordering::Relaxed)
  }
}

/// How to wake a parked waiter.
#[derive(Debug)]
enum Wake {
  Sync(Thread),
  Async(Waker),
}

impl Wake {
  fn wake(self) {
    match self {
      Wake::Sync(thread) => thread.unpark(),
      Wake::Async(waker) => waker.wake(),
    }
  }

  fn will_wake(&self, waker: &Waker) -> bool {
    match self {
      Wake::Async(self_waker) => self_waker.will_wake(waker),
      Wake::Sync(_) => false,
    }
  }
}

#[derive(Debug)]
struct Waiter {
  ticket: Arc<Ticket>,
  wake: Wake,
}

/// The internal state of the `Semaphore`, protected by a `Mutex`.
#[derive(Debug)]
struct SemInternal {
  /// The number of currently available permits.
  permits: usize,
  /// A fair (FIFO) queue of waiting threads and tasks.
  waiters: VecDeque<Waiter>,
  closed: bool,
}

impl SemInternal {
  fn forget(&mut self, ticket: &Arc<Ticket>) {
    self.waiters.retain(|w| !Arc::ptr_eq(&w.ticket, ticket));
  }
}

/// A counting semaphore with a fixed maximum permit count.
pub struct Semaphore {
  max: usize,
  internal: Mutex<SemInternal>,
}

impl fmt::Debug for Semaphore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let internal = self.internal.lock();
    f.debug_struct("Semaphore")
      .field("max", &self.max)
      .field("permits", &internal.permits)
      .field("waiters", &internal.waiters.len())
      .field("closed", &internal.closed)
      .finish()
  }
}

impl Semaphore {
  /// Creates a semaphore holding `initial` permits, never more than `max`.
  ///
  /// # Panics
  ///
  /// Panics if `initial > max`.
  pub fn new(initial: usize, max: usize) -> Self {
    assert!(
      initial <= max,
      "initial permits ({}) exceed the maximum ({})",
      initial,
      max
    );
    Self {
      max,
      internal: Mutex::new(SemInternal {
        permits: initial,
        waiters: VecDeque::new(),
        closed: false,
      }),
    }
  }

  /// Returns the maximum number of permits.
  pub fn max_permits(&self) -> usize {
    self.max
  }

  /// Returns the number of permits available right now.
  pub fn available(&self) -> usize {
    self.internal.lock().permits
  }

  /// Returns the number of threads and tasks queued for a permit.
  pub fn waiting(&self) -> usize {
    self.internal.lock().waiters.len()
  }

  pub fn is_closed(&self) -> bool {
    self.internal.lock().closed
  }

  /// Acquires a permit, blocking the current thread until one is available.
  ///
  /// # Errors
  ///
  /// `SemaphoreError::Closed` if the semaphore is, or becomes, closed before a
  /// permit is granted.
  pub fn acquire(&self) -> Result<(), SemaphoreError> {
    self.acquire_until(None)
  }

  /// Like [`acquire`](Self::acquire), giving up after `timeout`.
  pub fn acquire_timeout(&self, timeout: Duration) -> Result<(), SemaphoreError> {
    self.acquire_until(Some(Instant::now() + timeout))
  }

  fn acquire_until(&self, deadline: Option<Instant>) -> Result<(), SemaphoreError> {
    let mut internal = self.internal.lock();
    if internal.closed {
      return Err(SemaphoreError::Closed);
    }
    if internal.permits > 0 {
      internal.permits -= 1;
      return Ok(());
    }

    let ticket = Arc::new(Ticket::default());
    internal.waiters.push_back(Waiter {
      ticket: ticket.clone(),
      wake: Wake::Sync(thread::current()),
    });

    loop {
      MutexGuard::unlocked(&mut internal, || {
        sync_util::park_until(deadline);
      });

      // A grant wins over a concurrent close or timeout: the permit is ours.
      if ticket.is_granted() {
        return Ok(());
      }
      if internal.closed {
        return Err(SemaphoreError::Closed);
      }
      if sync_util::deadline_passed(deadline) {
        internal.forget(&ticket);
        return Err(SemaphoreError::Timeout);
      }
      // Spurious wakeup, still queued.
    }
  }

  /// Acquires a permit asynchronously.
  pub fn acquire_async(&self) -> Acquire<'_> {
    Acquire {
      sem: self,
      ticket: None,
    }
  }

  /// Takes a permit only if one is available right now.
  pub fn try_acquire(&self) -> Result<(), SemaphoreError> {
    let mut internal = self.internal.lock();
    if internal.closed {
      return Err(SemaphoreError::Closed);
    }
    if internal.permits > 0 {
      internal.permits -= 1;
      Ok(())
    } else {
      Err(SemaphoreError::NoPermits)
    }
  }

  /// Posts one permit, waking the oldest waiter if there is one.
  pub fn release(&self) {
    let mut internal = self.internal.lock();
    self.release_locked(&mut internal);
  }

  fn release_locked(&self, internal: &mut SemInternal) {
    if let Some(waiter) = internal.waiters.pop_front() {
      // Hand the permit straight to the waiter. We keep the lock while
      // waking; unpark and wake are cheap.
      waiter.ticket.grant();
      waiter.wake.wake();
    } else {
      internal.permits = (internal.permits + 1).min(self.max);
    }
  }

  /// Closes the semaphore. Every queued waiter wakes with
  /// `SemaphoreError::Closed` and later acquires fail immediately.
  ///
  /// Returns `false` if it was already closed.
  pub fn close(&self) -> bool {
    let mut internal = self.internal.lock();
    if internal.closed {
      return false;
    }
    internal.closed = true;
    for waiter in internal.waiters.drain(..) {
      waiter.wake.wake();
    }
    true
  }
}

/// A future that resolves when a permit is acquired from a [`Semaphore`].
///
/// Dropping it while queued removes it from the queue; dropping it after a
/// permit was granted but before it was observed passes the permit on.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct Acquire<'a> {
  sem: &'a Semaphore,
  ticket: Option<Arc<Ticket>>,
}

impl Future for Acquire<'_> {
  type Output = Result<(), SemaphoreError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let mut internal = this.sem.internal.lock();

    if let Some(ticket) = this.ticket.clone() {
      if ticket.is_granted() {
        this.ticket = None;
        return Poll::Ready(Ok(()));
      }
      if internal.closed {
        this.ticket = None;
        return Poll::Ready(Err(SemaphoreError::Closed));
      }
      // Still queued; make sure the latest waker is the one we wake.
      if let Some(waiter) = internal
        .waiters
        .iter_mut()
        .find(|w| Arc::ptr_eq(&w.ticket, &ticket))
      {
        if !waiter.wake.will_wake(cx.waker()) {
          waiter.wake = Wake::Async(cx.waker().clone());
        }
      }
      return Poll::Pending;
    }

    if internal.closed {
      return Poll::Ready(Err(SemaphoreError::Closed));
    }
    if internal.permits > 0 {
      internal.permits -= 1;
      return Poll::Ready(Ok(()));
    }

    let ticket = Arc::new(Ticket::default());
    internal.waiters.push_back(Waiter {
      ticket: ticket.clone(),
      wake: Wake::Async(cx.waker().clone()),
    });
    this.ticket = Some(ticket);
    Poll::Pending
  }
}

impl Drop for Acquire<'_> {
  fn drop(&mut self) {
    if let Some(ticket) = self.ticket.take() {
      let mut internal = self.sem.internal.lock();
      if ticket.is_granted() {
        self.sem.release_locked(&mut internal);
      } else {
        internal.forget(&ticket);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use tokio::time::timeout;

  fn wait_for_waiters(sem: &Semaphore, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while sem.waiting() < n {
      assert!(Instant::now() < deadline, "waiters never queued");
      thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn new_reports_initial_and_max() {
    let sem = Semaphore::new(0, 5);
    assert_eq!(sem.max_permits(), 5);
    assert_eq!(sem.available(), 0);
    assert!(!sem.is_closed());
  }

  #[test]
  #[should_panic(expected = "exceed the maximum")]
  fn initial_above_max_panics() {
    let _ = Semaphore::new(3, 2);
  }

  #[test]
  fn acquire_release_round_trip() {
    let sem = Semaphore::new(1, 1);
    sem.acquire().unwrap();
    assert_eq!(sem.available(), 0);
    assert_eq!(sem.try_acquire(), Err(SemaphoreError::NoPermits));
    sem.release();
    assert_eq!(sem.available(), 1);
  }

  #[test]
  fn release_without_waiters_is_capped_at_max() {
    let sem = Semaphore::new(2, 2);
    sem.release();
    sem.release();
    assert_eq!(sem.available(), 2);
  }

  #[test]
  fn acquire_blocks_and_unblocks() {
    let sem = Arc::new(Semaphore::new(0, 1));

    let sem_clone = sem.clone();
    let handle = thread::spawn(move || sem_clone.acquire());

    wait_for_waiters(&sem, 1);
    assert!(!handle.is_finished(), "Thread should have blocked");

    sem.release();
    handle.join().expect("Thread panicked").unwrap();
    // The permit went to the waiter, not the counter.
    assert_eq!(sem.available(), 0);
  }

  #[test]
  fn waiters_are_served_in_arrival_order() {
    let sem = Arc::new(Semaphore::new(0, 3));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for id in 0..3 {
      let sem_clone = sem.clone();
      let order = order.clone();
      handles.push(thread::spawn(move || {
        sem_clone.acquire().unwrap();
        order.lock().push(id);
      }));
      wait_for_waiters(&sem, id + 1);
    }

    for _ in 0..3 {
      sem.release();
      thread::sleep(Duration::from_millis(20));
    }
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
  }

  #[test]
  fn new_arrival_cannot_steal_a_handed_off_permit() {
    let sem = Arc::new(Semaphore::new(0, 1));
    let sem_clone = sem.clone();
    let handle = thread::spawn(move || sem_clone.acquire());
    wait_for_waiters(&sem, 1);

    sem.release();
    assert_eq!(sem.try_acquire(), Err(SemaphoreError::NoPermits));
    handle.join().unwrap().unwrap();
  }

  #[test]
  fn acquire_timeout_expires() {
    let sem = Semaphore::new(0, 1);
    let start = Instant::now();
    assert_eq!(
      sem.acquire_timeout(Duration::from_millis(50)),
      Err(SemaphoreError::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(sem.waiting(), 0, "timed out waiter must leave the queue");
  }

  #[test]
  fn close_wakes_blocked_waiters() {
    let sem = Arc::new(Semaphore::new(0, 2));
    let mut handles = Vec::new();
    for _ in 0..2 {
      let sem = sem.clone();
      handles.push(thread::spawn(move || sem.acquire()));
    }
    wait_for_waiters(&sem, 2);

    assert!(sem.close());
    assert!(!sem.close());
    for handle in handles {
      assert_eq!(handle.join().unwrap(), Err(SemaphoreError::Closed));
    }
    assert_eq!(sem.try_acquire(), Err(SemaphoreError::Closed));
  }

  #[tokio::test]
  async fn acquire_async_waits_and_completes() {
    let sem = Arc::new(Semaphore::new(0, 1));

    let sem_for_spawn = sem.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      sem_for_spawn.release();
    });

    timeout(Duration::from_millis(500), sem.acquire_async())
      .await
      .expect("Future did not complete after release")
      .unwrap();
  }

  #[tokio::test]
  async fn dropped_async_acquire_leaves_the_queue() {
    let sem = Semaphore::new(0, 1);
    let res = timeout(Duration::from_millis(20), sem.acquire_async()).await;
    assert!(res.is_err());
    assert_eq!(sem.waiting(), 0);
    sem.release();
    assert_eq!(sem.available(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn mixed_waiters_contention() {
    let sem = Arc::new(Semaphore::new(2, 2));
    let mut thread_handles = Vec::new();
    let mut task_handles = Vec::new();
    let completion_count = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      let sem = sem.clone();
      let count = completion_count.clone();
      thread_handles.push(thread::spawn(move || {
        sem.acquire().unwrap();
        thread::sleep(Duration::from_millis(50));
        sem.release();
        count.fetch_add(1, Ordering::Relaxed);
      }));
    }

    for _ in 0..3 {
      let sem = sem.clone();
      let count = completion_count.clone();
      task_handles.push(tokio::spawn(async move {
        sem.acquire_async().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sem.release();
        count.fetch_add(1, Ordering::Relaxed);
      }));
    }

    for handle in task_handles {
      handle.await.unwrap();
    }
    for handle in thread_handles {
      handle.join().unwrap();
    }

    assert_eq!(completion_count.load(Ordering::Relaxed), 6);
    assert_eq!(sem.available(), 2);
  }
}
