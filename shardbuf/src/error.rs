// src/error.rs

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::worker::Role;

/// Error returned when a permit could not be taken from a [`Semaphore`](crate::coord::Semaphore).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SemaphoreError {
  /// The semaphore was closed while waiting, or before the call.
  #[error("semaphore closed")]
  Closed,
  /// No permit became available before the deadline.
  #[error("timed out waiting for a permit")]
  Timeout,
  /// `try_acquire` found no permit.
  #[error("no permits available")]
  NoPermits,
}

/// Errors raised by a single shard operation.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ShardError {
  /// The shard was closed; blocked and future operations fail with this.
  #[error("shard {shard} is closed")]
  Closed { shard: usize },
  /// A timed operation did not get a slot (or an item) in time.
  #[error("shard {shard} operation timed out")]
  Timeout { shard: usize },
  /// `try_enqueue` found no free slot.
  #[error("shard {shard} is full")]
  Full { shard: usize },
  /// `try_dequeue` found no occupied slot.
  #[error("shard {shard} is empty")]
  Empty { shard: usize },
  /// The slot under the read cursor was empty even though an `occupied`
  /// permit had been taken. The shard's accounting is broken.
  #[error("shard {shard} slot {cursor} was empty after an occupied permit was taken")]
  CorruptSlot { shard: usize, cursor: usize },
}

impl ShardError {
  /// Maps a failed wait by `role` on shard `shard`. A producer that finds no
  /// permit saw a full shard; a consumer saw an empty one.
  pub(crate) fn from_semaphore(shard: usize, err: SemaphoreError, role: Role) -> Self {
    match (err, role) {
      (SemaphoreError::Closed, _) => ShardError::Closed { shard },
      (SemaphoreError::Timeout, _) => ShardError::Timeout { shard },
      (SemaphoreError::NoPermits, Role::Producer) => ShardError::Full { shard },
      (SemaphoreError::NoPermits, Role::Consumer) => ShardError::Empty { shard },
    }
  }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Configuration file not found: {0}")]
  NotFound(String),

  #[error("Failed to read configuration file: {0}")]
  Read(#[from] io::Error),

  #[error("Failed to parse configuration: {0}")]
  Parse(#[from] serde_yaml::Error),

  #[error("Invalid configuration value for '{field}': {message}")]
  InvalidValue { field: &'static str, message: String },

  #[error("Failed to set global tracing subscriber: {0}")]
  LoggingInit(String),
}

impl ConfigError {
  pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
    ConfigError::InvalidValue {
      field,
      message: message.into(),
    }
  }
}

/// Errors that abort a coordinator run.
#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// The routing plan would leave some worker blocked forever.
  #[error(
    "shard {shard} is misrouted: {producers} producer(s) enqueue {produced} item(s), \
     {consumers} consumer(s) dequeue {consumed} item(s)"
  )]
  Misrouted {
    shard: usize,
    producers: usize,
    consumers: usize,
    produced: usize,
    consumed: usize,
  },

  /// The OS refused to create a worker thread.
  #[error("failed to spawn {role} for pair {pair}: {source}")]
  Spawn {
    role: Role,
    pair: usize,
    #[source]
    source: io::Error,
  },

  #[error("{role} for pair {pair} failed: {source}")]
  Worker {
    role: Role,
    pair: usize,
    #[source]
    source: ShardError,
  },

  #[error("{role} for pair {pair} panicked")]
  WorkerPanicked { role: Role, pair: usize },

  #[error("run was cancelled")]
  Cancelled,

  /// Workers were still blocked when the run deadline passed.
  #[error("run stalled: {unfinished} worker(s) unfinished after {deadline:?}")]
  Stalled { deadline: Duration, unfinished: usize },
}

/// A specialized `Result` type for coordinator runs.
pub type Result<T, E = RunError> = std::result::Result<T, E>;
