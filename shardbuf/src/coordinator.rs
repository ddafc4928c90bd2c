//! The run coordinator: owns the shards, spawns one producer and one consumer
//! thread per pair, joins them and merges the per-shard tallies.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::config::RunConfig;
use crate::error::{ConfigError, Result, RunError, ShardError};
use crate::reconcile::Reconciliation;
use crate::router::RoutingPlan;
use crate::shard::{Shard, ShardStats};
use crate::tally::{Item, ItemTally};
use crate::worker::{Role, ValueSource, WeylSource, Worker, WorkerError, WorkerSpec, WorkerSummary};

/// Knobs for a single run that are not part of the buffer's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
  /// Refuse plans where some shard is not served by a balanced set of
  /// producers and consumers. Disabling this lets a misrouted plan run (and
  /// deadlock).
  pub check_routing: bool,
  /// Cancel the run as stalled if workers are still running after this long.
  pub deadline: Option<Duration>,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      check_routing: true,
      deadline: None,
    }
  }
}

impl From<&RunConfig> for RunOptions {
  fn from(config: &RunConfig) -> Self {
    Self {
      deadline: config.deadline,
      ..Self::default()
    }
  }
}

/// Closes every shard of a run, waking all blocked workers.
///
/// Obtained before the run starts; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle<T: Item> {
  shards: Arc<[Shard<T>]>,
  cancelled: Arc<AtomicBool>,
}

impl<T: Item> CancelHandle<T> {
  pub fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      debug!("run cancellation requested");
    }
    close_all(&self.shards);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}

type WorkerOutcome = std::result::Result<WorkerSummary, WorkerError>;
type WorkerBody = Box<dyn FnOnce() -> WorkerOutcome + Send>;

/// Starts a worker on its own named OS thread.
fn spawn_named(spec: &WorkerSpec, body: WorkerBody) -> io::Result<JoinHandle<WorkerOutcome>> {
  thread::Builder::new().name(spec.thread_name()).spawn(body)
}

fn close_all<T: Item>(shards: &[Shard<T>]) {
  for shard in shards {
    shard.close();
  }
}

/// Counts finished workers so the coordinator can wait with a deadline.
#[derive(Debug)]
struct RunLatch {
  remaining: Mutex<usize>,
  all_done: Condvar,
}

impl RunLatch {
  fn new(workers: usize) -> Self {
    Self {
      remaining: Mutex::new(workers),
      all_done: Condvar::new(),
    }
  }

  fn count_down(&self) {
    let mut remaining = self.remaining.lock();
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
      self.all_done.notify_all();
    }
  }

  /// Returns the number of workers still running when it gave up, or 0.
  fn wait_timeout(&self, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut remaining = self.remaining.lock();
    while *remaining > 0 {
      if self.all_done.wait_until(&mut remaining, deadline).timed_out() {
        break;
      }
    }
    *remaining
  }
}

/// Held by each worker thread. Counts the worker down however it exits and
/// tears the run down if it panicked, so its partner cannot block forever.
struct WorkerGuard<T: Item> {
  spec: WorkerSpec,
  latch: Arc<RunLatch>,
  shards: Arc<[Shard<T>]>,
}

impl<T: Item> Drop for WorkerGuard<T> {
  fn drop(&mut self) {
    if thread::panicking() {
      error!(role = %self.spec.role, pair = self.spec.pair, "worker panicked; closing all shards");
      close_all(&self.shards);
    }
    self.latch.count_down();
  }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport<T: Item> {
  /// Per-shard tallies merged into one.
  pub tally: ItemTally<T>,
  /// Wall-clock time from the first spawn to the last join.
  pub elapsed: Duration,
  pub shards: Vec<ShardStats>,
  pub workers: Vec<WorkerSummary>,
  /// Items left out by `RemainderPolicy::Truncate`.
  pub dropped_items: usize,
}

impl<T: Item + Ord> RunReport<T> {
  pub fn reconcile(&self) -> Reconciliation<T> {
    Reconciliation::of(&self.tally)
  }
}

/// Owns the shard array for one run.
#[derive(Debug)]
pub struct Coordinator<T: Item> {
  config: RunConfig,
  shards: Arc<[Shard<T>]>,
  cancelled: Arc<AtomicBool>,
}

impl<T: Item> Coordinator<T> {
  /// Validates `config` and creates its shards.
  pub fn new(config: RunConfig) -> Result<Self> {
    config.validate()?;
    let shards: Arc<[Shard<T>]> = (0..config.shards)
      .map(|id| Shard::new(id, config.capacity_per_shard))
      .collect();
    Ok(Self {
      config,
      shards,
      cancelled: Arc::new(AtomicBool::new(false)),
    })
  }

  pub fn config(&self) -> &RunConfig {
    &self.config
  }

  pub fn shards(&self) -> &[Shard<T>] {
    &self.shards
  }

  pub fn cancel_handle(&self) -> CancelHandle<T> {
    CancelHandle {
      shards: self.shards.clone(),
      cancelled: self.cancelled.clone(),
    }
  }

  /// Runs the configured balanced plan, asking `make_source` for each
  /// producer's value source.
  pub fn run_with_source<S, F>(self, make_source: F) -> Result<RunReport<T>>
  where
    S: ValueSource<T> + 'static,
    F: FnMut(&WorkerSpec) -> S,
  {
    let plan = RoutingPlan::balanced(&self.config)?;
    let options = RunOptions::from(&self.config);
    self.run_plan(plan, options, make_source)
  }

  /// Runs an explicit routing plan.
  ///
  /// # Errors
  ///
  /// - `RunError::Misrouted` if `options.check_routing` is set and the plan is
  ///   unbalanced.
  /// - `RunError::Spawn` if a worker thread could not be created. Workers
  ///   already started are stopped and joined first.
  /// - `RunError::WorkerPanicked`, `RunError::Stalled`, `RunError::Cancelled`
  ///   or `RunError::Worker` if the run did not finish normally.
  pub fn run_plan<S, F>(
    self,
    plan: RoutingPlan,
    options: RunOptions,
    make_source: F,
  ) -> Result<RunReport<T>>
  where
    S: ValueSource<T> + 'static,
    F: FnMut(&WorkerSpec) -> S,
  {
    self.run_plan_with(plan, options, make_source, spawn_named)
  }

  /// [`Coordinator::run_plan`] with the thread spawner supplied by the caller.
  fn run_plan_with<S, F, Sp>(
    self,
    plan: RoutingPlan,
    options: RunOptions,
    mut make_source: F,
    mut spawn: Sp,
  ) -> Result<RunReport<T>>
  where
    S: ValueSource<T> + 'static,
    F: FnMut(&WorkerSpec) -> S,
    Sp: FnMut(&WorkerSpec, WorkerBody) -> io::Result<JoinHandle<WorkerOutcome>>,
  {
    if plan.shard_count() != self.shards.len() {
      return Err(
        ConfigError::invalid(
          "shards",
          format!(
            "routing plan targets {} shard(s), coordinator owns {}",
            plan.shard_count(),
            self.shards.len()
          ),
        )
        .into(),
      );
    }
    if options.check_routing {
      plan.validate()?;
    }

    let span = info_span!(
      "run",
      shards = self.shards.len(),
      pairs = plan.routes().len(),
      items = plan.total_items()
    );
    let _enter = span.enter();

    let dropped_items = self.config.dropped_items();
    if dropped_items > 0 {
      warn!(dropped_items, "remainder truncated; fewer items than configured will move");
    }

    let specs: Vec<WorkerSpec> = plan.workers().collect();
    let latch = Arc::new(RunLatch::new(specs.len()));
    let start = Instant::now();

    let mut handles: Vec<(WorkerSpec, JoinHandle<WorkerOutcome>)> = Vec::with_capacity(specs.len());
    for spec in specs {
      let worker = match spec.role {
        Role::Producer => Worker::producer(spec.pair, spec.shard, spec.iterations, make_source(&spec)),
        Role::Consumer => Worker::consumer(spec.pair, spec.shard, spec.iterations),
      };
      let guard = WorkerGuard {
        spec,
        latch: latch.clone(),
        shards: self.shards.clone(),
      };
      let spawned = spawn(
        &spec,
        Box::new(move || {
          let guard = guard;
          worker.run(&guard.shards[spec.shard])
        }),
      );

      match spawned {
        Ok(handle) => handles.push((spec, handle)),
        Err(source) => {
          error!(role = %spec.role, pair = spec.pair, error = %source, "failed to spawn worker; stopping run");
          close_all(&self.shards);
          for (_, handle) in handles {
            let _ = handle.join();
          }
          return Err(RunError::Spawn {
            role: spec.role,
            pair: spec.pair,
            source,
          });
        }
      }
    }
    debug!(workers = handles.len(), "all workers spawned");

    let mut stalled = None;
    if let Some(deadline) = options.deadline {
      let unfinished = latch.wait_timeout(deadline);
      if unfinished > 0 {
        warn!(?deadline, unfinished, "run stalled; closing all shards");
        close_all(&self.shards);
        stalled = Some(RunError::Stalled {
          deadline,
          unfinished,
        });
      }
    }

    let mut workers = Vec::with_capacity(handles.len());
    let mut panicked = None;
    let mut failed = None;
    let mut closed = false;
    for (spec, handle) in handles {
      match handle.join() {
        Ok(Ok(summary)) => workers.push(summary),
        Ok(Err(WorkerError { summary, source })) => {
          workers.push(summary);
          if let ShardError::Closed { .. } = source {
            closed = true;
          } else if failed.is_none() {
            failed = Some(RunError::Worker {
              role: spec.role,
              pair: spec.pair,
              source,
            });
          }
        }
        Err(_) => {
          panicked.get_or_insert(RunError::WorkerPanicked {
            role: spec.role,
            pair: spec.pair,
          });
        }
      }
    }
    let elapsed = start.elapsed();

    if let Some(err) = panicked.or(stalled) {
      return Err(err);
    }
    if closed {
      // Shards only close through cancellation here; a stall or a panic was
      // reported above.
      info!(?elapsed, "run cancelled");
      return Err(RunError::Cancelled);
    }
    if let Some(err) = failed {
      return Err(err);
    }

    let tally: ItemTally<T> = self.shards.iter().map(Shard::take_tally).collect();
    let shards: Vec<ShardStats> = self.shards.iter().map(Shard::stats).collect();
    info!(
      ?elapsed,
      produced = tally.total_produced(),
      consumed = tally.total_consumed(),
      "run finished"
    );

    Ok(RunReport {
      tally,
      elapsed,
      shards,
      workers,
      dropped_items,
    })
  }
}

impl Coordinator<u64> {
  /// Runs the configured plan with seeded pseudo-random values in
  /// `[0, value_range)`; each pair gets its own stream.
  pub fn run(self) -> Result<RunReport<u64>> {
    let seed = self.config.seed;
    let range = self.config.value_range;
    self.run_with_source(move |spec: &WorkerSpec| {
      WeylSource::new(seed ^ (spec.pair as u64).wrapping_mul(0x2545F4914F6CDD1D), range)
    })
  }
}

/// Creates a coordinator for `config` and runs it to completion.
pub fn run(config: RunConfig) -> Result<RunReport<u64>> {
  Coordinator::new(config)?.run()
}
