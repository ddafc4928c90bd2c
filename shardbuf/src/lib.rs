//! A sharded bounded-buffer engine.
//!
//! The buffer is split into independent shards, each a fixed-capacity ring
//! with its own lock and its own pair of counting semaphores (free slots and
//! occupied slots). Producer and consumer threads are spawned in pairs, each
//! pair bound to one shard, so workers on different shards never contend.
//! With a single shard this is the classic bounded buffer.
//!
//! ```no_run
//! use shardbuf::{coordinator, RunConfig};
//!
//! let config = RunConfig::new(4, 2, 100, 4)?;
//! let report = coordinator::run(config)?;
//! println!("took {:?}", report.elapsed);
//! for mismatch in report.reconcile().mismatches() {
//!   println!("{}", mismatch);
//! }
//! # Ok::<(), shardbuf::RunError>(())
//! ```

pub mod config;
pub mod coord;
pub mod coordinator;
pub mod error;
pub mod reconcile;
pub mod router;
pub mod shard;
pub mod tally;
pub mod telemetry;
pub mod worker;

mod sync_util;

pub use config::{Config, LoggingConfig, RemainderPolicy, RunConfig};
pub use coordinator::{CancelHandle, Coordinator, RunOptions, RunReport};
pub use error::{ConfigError, RunError, SemaphoreError, ShardError};
pub use reconcile::{verify, Mismatch, Reconciliation};
pub use router::{RoutingPlan, ShardRouter};
pub use shard::{Shard, ShardStats};
pub use tally::{Item, ItemTally};
pub use worker::{Role, ValueSource, WeylSource, Worker, WorkerSpec, WorkerSummary};
