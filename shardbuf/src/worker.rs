//! Producer and consumer workers.
//!
//! A worker is a plain sequential loop of blocking shard operations. It is the
//! unit of concurrency; nothing inside it runs in parallel.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ShardError;
use crate::shard::Shard;
use crate::tally::Item;

const WEYL_CONSTANT: u64 = 0x9E3779B97F4A7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  Producer,
  Consumer,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Producer => f.write_str("producer"),
      Role::Consumer => f.write_str("consumer"),
    }
  }
}

/// Immutable per-worker configuration, moved into the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
  pub role: Role,
  /// Index of the producer/consumer pair this worker belongs to.
  pub pair: usize,
  /// The shard this worker operates on exclusively.
  pub shard: usize,
  pub iterations: usize,
}

impl WorkerSpec {
  /// The OS thread name used for this worker.
  pub fn thread_name(&self) -> String {
    format!("shardbuf-{}-{}", self.role, self.pair)
  }
}

/// What a worker did before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
  pub spec: WorkerSpec,
  pub completed: usize,
  pub elapsed: Duration,
}

/// A worker stopped before finishing its iterations.
#[derive(Debug, Error)]
#[error("{} for pair {} stopped after {} of {} iteration(s): {source}",
  .summary.spec.role, .summary.spec.pair, .summary.completed, .summary.spec.iterations)]
pub struct WorkerError {
  pub summary: WorkerSummary,
  #[source]
  pub source: ShardError,
}

/// Supplies the values a producer enqueues.
pub trait ValueSource<T>: Send {
  fn next_value(&mut self) -> T;
}

impl<T, F> ValueSource<T> for F
where
  F: FnMut() -> T + Send,
{
  #[inline]
  fn next_value(&mut self) -> T {
    self()
  }
}

/// A seeded, non-cryptographic generator of values in `[0, range)`.
///
/// Walks a Weyl sequence and scrambles each step with the splitmix64
/// finalizer. Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct WeylSource {
  state: u64,
  range: u64,
}

impl WeylSource {
  /// # Panics
  ///
  /// Panics if `range` is 0.
  pub fn new(seed: u64, range: u64) -> Self {
    assert!(range > 0, "value range must be at least 1");
    Self {
      state: if seed == 0 { 1 } else { seed },
      range,
    }
  }
}

impl ValueSource<u64> for WeylSource {
  #[inline]
  fn next_value(&mut self) -> u64 {
    self.state = self.state.wrapping_add(WEYL_CONSTANT);
    let mut z = self.state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    (z ^ (z >> 31)) % self.range
  }
}

/// A producer or consumer bound to one shard.
pub enum Worker<S> {
  Producer { spec: WorkerSpec, source: S },
  Consumer { spec: WorkerSpec },
}

impl<S> fmt::Debug for Worker<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Worker").field(self.spec()).finish()
  }
}

impl<S> Worker<S> {
  pub fn producer(pair: usize, shard: usize, iterations: usize, source: S) -> Self {
    Worker::Producer {
      spec: WorkerSpec {
        role: Role::Producer,
        pair,
        shard,
        iterations,
      },
      source,
    }
  }

  pub fn consumer(pair: usize, shard: usize, iterations: usize) -> Self {
    Worker::Consumer {
      spec: WorkerSpec {
        role: Role::Consumer,
        pair,
        shard,
        iterations,
      },
    }
  }

  pub fn spec(&self) -> &WorkerSpec {
    match self {
      Worker::Producer { spec, .. } | Worker::Consumer { spec } => spec,
    }
  }

  /// Runs the worker's fixed iteration count against `shard`.
  ///
  /// Only returns early if the shard is closed (or its accounting breaks);
  /// otherwise every iteration blocks until it succeeds.
  pub fn run<T>(self, shard: &Shard<T>) -> Result<WorkerSummary, WorkerError>
  where
    T: Item,
    S: ValueSource<T>,
  {
    let spec = *self.spec();
    debug_assert_eq!(spec.shard, shard.id(), "worker handed the wrong shard");
    debug!(role = %spec.role, pair = spec.pair, shard = spec.shard, iterations = spec.iterations, "worker started");

    let start = Instant::now();
    let mut completed = 0;
    let result = match self {
      Worker::Producer { mut source, .. } => loop {
        if completed == spec.iterations {
          break Ok(());
        }
        let value = source.next_value();
        trace!(pair = spec.pair, shard = spec.shard, value = ?value, "producer sent");
        if let Err(e) = shard.enqueue(value) {
          break Err(e);
        }
        completed += 1;
      },
      Worker::Consumer { .. } => loop {
        if completed == spec.iterations {
          break Ok(());
        }
        match shard.dequeue() {
          Ok(value) => {
            trace!(pair = spec.pair, shard = spec.shard, value = ?value, "consumer got");
            completed += 1;
          }
          Err(e) => break Err(e),
        }
      },
    };

    let summary = WorkerSummary {
      spec,
      completed,
      elapsed: start.elapsed(),
    };
    match result {
      Ok(()) => {
        debug!(role = %spec.role, pair = spec.pair, elapsed = ?summary.elapsed, "worker finished");
        Ok(summary)
      }
      Err(source) => {
        debug!(role = %spec.role, pair = spec.pair, completed, error = %source, "worker stopped early");
        Err(WorkerError { summary, source })
      }
    }
  }
}
