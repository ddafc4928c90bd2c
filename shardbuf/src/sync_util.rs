//! Utilities for synchronous blocking and parking.
//! Minimal helpers around std::thread::park/unpark; callers own the state
//! that decides whether a wakeup was real.

use std::thread;
use std::time::Instant;

/// Parks the current thread.
#[inline]
pub(crate) fn park_thread() {
  thread::park();
}

/// Parks the current thread until `deadline`, or indefinitely when `None`.
///
/// Returns `false` once the deadline has already passed, without parking.
#[inline]
pub(crate) fn park_until(deadline: Option<Instant>) -> bool {
  match deadline {
    None => {
      park_thread();
      true
    }
    Some(deadline) => {
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      thread::park_timeout(deadline - now);
      true
    }
  }
}

/// Returns `true` if `deadline` is set and has passed.
#[inline]
pub(crate) fn deadline_passed(deadline: Option<Instant>) -> bool {
  deadline.is_some_and(|d| Instant::now() >= d)
}
