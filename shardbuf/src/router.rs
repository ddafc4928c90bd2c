//! Routing of producer/consumer pairs onto shards.
//!
//! A pair is one producer and one consumer that share a shard. Pair `i` goes
//! to shard `i mod shard_count`; with one shard every pair shares it and the
//! engine degenerates into a plain bounded buffer.
//!
//! A producer routed to a shard that nothing drains blocks forever once the
//! shard fills. [`RoutingPlan::validate`] catches that before any thread is
//! spawned.

use crate::config::RunConfig;
use crate::error::RunError;
use crate::worker::{Role, WorkerSpec};

/// Maps a worker pair index to its shard.
#[inline]
pub fn assign(pair_index: usize, shard_count: usize) -> usize {
  pair_index % shard_count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
  shard_count: usize,
}

impl ShardRouter {
  /// # Panics
  ///
  /// Panics if `shard_count` is 0.
  pub fn new(shard_count: usize) -> Self {
    assert!(shard_count > 0, "shard count must be at least 1");
    Self { shard_count }
  }

  pub fn shard_count(&self) -> usize {
    self.shard_count
  }

  #[inline]
  pub fn assign(&self, pair_index: usize) -> usize {
    assign(pair_index, self.shard_count)
  }
}

/// Where one pair's producer and consumer run, and how much they move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRoute {
  pub pair: usize,
  pub producer_shard: usize,
  pub consumer_shard: usize,
  pub iterations: usize,
}

impl PairRoute {
  pub fn producer(&self) -> WorkerSpec {
    WorkerSpec {
      role: Role::Producer,
      pair: self.pair,
      shard: self.producer_shard,
      iterations: self.iterations,
    }
  }

  pub fn consumer(&self) -> WorkerSpec {
    WorkerSpec {
      role: Role::Consumer,
      pair: self.pair,
      shard: self.consumer_shard,
      iterations: self.iterations,
    }
  }
}

/// Workers and work routed to one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardLoad {
  pub shard: usize,
  pub producers: usize,
  pub consumers: usize,
  /// Total enqueues the shard's producers will attempt.
  pub produced: usize,
  /// Total dequeues the shard's consumers will attempt.
  pub consumed: usize,
}

impl ShardLoad {
  pub fn is_balanced(&self) -> bool {
    self.producers > 0 && self.consumers > 0 && self.produced == self.consumed
  }
}

/// The full assignment of workers to shards for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
  shard_count: usize,
  routes: Vec<PairRoute>,
}

impl RoutingPlan {
  /// The standard plan: pair `i` on shard `i mod shards`, iterations split
  /// under the configured remainder policy.
  ///
  /// `config` is validated first, since its fields are public and may not
  /// have gone through [`RunConfig::new`].
  pub fn balanced(config: &RunConfig) -> Result<Self, RunError> {
    config.validate()?;
    Ok(Self::from_iterations(config.shards, &config.iterations_per_pair()))
  }

  /// One pair per entry of `iterations`, each routed by [`ShardRouter`].
  ///
  /// # Panics
  ///
  /// Panics if `shard_count` is 0.
  pub fn from_iterations(shard_count: usize, iterations: &[usize]) -> Self {
    let router = ShardRouter::new(shard_count);
    let routes = iterations
      .iter()
      .enumerate()
      .map(|(pair, &iterations)| {
        let shard = router.assign(pair);
        PairRoute {
          pair,
          producer_shard: shard,
          consumer_shard: shard,
          iterations,
        }
      })
      .collect();
    Self {
      shard_count,
      routes,
    }
  }

  pub fn shard_count(&self) -> usize {
    self.shard_count
  }

  pub fn routes(&self) -> &[PairRoute] {
    &self.routes
  }

  /// Total items producers will enqueue.
  pub fn total_items(&self) -> usize {
    self.routes.iter().map(|r| r.iterations).sum()
  }

  fn route_mut(&mut self, pair: usize, shard: usize) -> &mut PairRoute {
    assert!(
      shard < self.shard_count,
      "shard {} out of range ({} shards)",
      shard,
      self.shard_count
    );
    let pairs = self.routes.len();
    self
      .routes
      .get_mut(pair)
      .unwrap_or_else(|| panic!("pair {} out of range ({} pairs)", pair, pairs))
  }

  /// Sends `pair`'s producer to `shard`, leaving its consumer in place.
  ///
  /// # Panics
  ///
  /// Panics if `pair` or `shard` is out of range.
  pub fn reroute_producer(&mut self, pair: usize, shard: usize) -> &mut Self {
    self.route_mut(pair, shard).producer_shard = shard;
    self
  }

  /// Sends `pair`'s consumer to `shard`, leaving its producer in place.
  ///
  /// # Panics
  ///
  /// Panics if `pair` or `shard` is out of range.
  pub fn reroute_consumer(&mut self, pair: usize, shard: usize) -> &mut Self {
    self.route_mut(pair, shard).consumer_shard = shard;
    self
  }

  /// Every worker spec in spawn order: producer then consumer, pair by pair.
  pub fn workers(&self) -> impl Iterator<Item = WorkerSpec> + '_ {
    self
      .routes
      .iter()
      .flat_map(|route| [route.producer(), route.consumer()])
  }

  /// Per-shard worker and item counts.
  pub fn load(&self) -> Vec<ShardLoad> {
    let mut load: Vec<ShardLoad> = (0..self.shard_count)
      .map(|shard| ShardLoad {
        shard,
        ..ShardLoad::default()
      })
      .collect();
    for route in &self.routes {
      let p = &mut load[route.producer_shard];
      p.producers += 1;
      p.produced += route.iterations;
      let c = &mut load[route.consumer_shard];
      c.consumers += 1;
      c.consumed += route.iterations;
    }
    load
  }

  /// Startup check: every shard has at least one producer and one consumer,
  /// and its producers enqueue exactly what its consumers dequeue.
  ///
  /// # Errors
  ///
  /// `RunError::Misrouted` for the first shard that fails the check.
  pub fn validate(&self) -> Result<(), RunError> {
    match self.load().into_iter().find(|l| !l.is_balanced()) {
      None => Ok(()),
      Some(l) => Err(RunError::Misrouted {
        shard: l.shard,
        producers: l.producers,
        consumers: l.consumers,
        produced: l.produced,
        consumed: l.consumed,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ConfigError;
  use pretty_assertions::assert_eq;

  #[test]
  fn pairs_wrap_around_shards() {
    let router = ShardRouter::new(4);
    let shards: Vec<usize> = (0..9).map(|p| router.assign(p)).collect();
    assert_eq!(shards, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
  }

  #[test]
  fn single_shard_takes_every_pair() {
    let router = ShardRouter::new(1);
    assert!((0..16).all(|p| router.assign(p) == 0));
  }

  #[test]
  fn balanced_plan_for_four_shards() {
    let config = RunConfig::new(4, 2, 100, 4).unwrap();
    let plan = RoutingPlan::balanced(&config).unwrap();
    assert_eq!(plan.total_items(), 100);
    plan.validate().unwrap();

    let load = plan.load();
    assert_eq!(load.len(), 4);
    for (shard, l) in load.iter().enumerate() {
      assert_eq!(
        *l,
        ShardLoad {
          shard,
          producers: 1,
          consumers: 1,
          produced: 25,
          consumed: 25,
        }
      );
    }
  }

  #[test]
  fn balanced_plan_rejects_a_hand_built_config() {
    let mut config = RunConfig::new(2, 2, 10, 2).unwrap();
    config.worker_pairs = 0;
    assert!(matches!(
      RoutingPlan::balanced(&config),
      Err(RunError::Config(ConfigError::InvalidValue {
        field: "worker_pairs",
        ..
      }))
    ));

    config.worker_pairs = 2;
    config.shards = 0;
    assert!(matches!(
      RoutingPlan::balanced(&config),
      Err(RunError::Config(ConfigError::InvalidValue { field: "shards", .. }))
    ));
  }

  #[test]
  fn workers_come_in_pairs() {
    let plan = RoutingPlan::from_iterations(2, &[3, 4]);
    let specs: Vec<WorkerSpec> = plan.workers().collect();
    assert_eq!(specs.len(), 4);
    assert_eq!(specs[0].role, Role::Producer);
    assert_eq!(specs[1].role, Role::Consumer);
    assert_eq!((specs[2].pair, specs[2].shard, specs[2].iterations), (1, 1, 4));
  }

  #[test]
  fn misrouted_producer_is_detected() {
    let mut plan = RoutingPlan::from_iterations(2, &[5, 5]);
    plan.reroute_producer(0, 1);

    match plan.validate() {
      Err(RunError::Misrouted {
        shard,
        producers,
        consumers,
        produced,
        consumed,
      }) => {
        assert_eq!(shard, 0);
        assert_eq!((producers, consumers), (0, 1));
        assert_eq!((produced, consumed), (0, 5));
      }
      other => panic!("expected misroute, got {other:?}"),
    }
  }

  #[test]
  fn unequal_iterations_on_a_shard_are_detected() {
    // Swap the consumers: each shard is served, but shard 0 gets 3 in, 4 out.
    let mut lopsided = RoutingPlan::from_iterations(2, &[3, 4]);
    lopsided.reroute_consumer(0, 1).reroute_consumer(1, 0);
    assert!(matches!(
      lopsided.validate(),
      Err(RunError::Misrouted {
        shard: 0,
        produced: 3,
        consumed: 4,
        ..
      })
    ));
  }

  #[test]
  #[should_panic(expected = "out of range")]
  fn rerouting_to_missing_shard_panics() {
    RoutingPlan::from_iterations(2, &[1, 1]).reroute_producer(0, 2);
  }
}
