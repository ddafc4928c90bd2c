//! Coordination primitives shared by every shard.

mod semaphore;

pub use semaphore::{Acquire, Semaphore};
