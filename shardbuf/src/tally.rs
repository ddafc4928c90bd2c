use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// Values that can travel through a shard and be tallied.
pub trait Item: Eq + Hash + Clone + Send + fmt::Debug + 'static {}

impl<T> Item for T where T: Eq + Hash + Clone + Send + fmt::Debug + 'static {}

/// Per-value produced and consumed counts.
///
/// Every shard keeps its own partial tally, updated under the shard lock at
/// the moment of enqueue or dequeue. The coordinator merges the partials once
/// all workers have joined.
#[derive(Clone)]
pub struct ItemTally<T: Item> {
  produced: HashMap<T, u64>,
  consumed: HashMap<T, u64>,
}

impl<T: Item> Default for ItemTally<T> {
  fn default() -> Self {
    Self {
      produced: HashMap::new(),
      consumed: HashMap::new(),
    }
  }
}

impl<T: Item> fmt::Debug for ItemTally<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ItemTally")
      .field("distinct_values", &self.values().count())
      .field("produced", &self.total_produced())
      .field("consumed", &self.total_consumed())
      .finish()
  }
}

fn bump<T: Item>(map: &mut HashMap<T, u64>, value: &T, by: u64) {
  // Skip the clone on the hot path when the key already exists.
  if let Some(count) = map.get_mut(value) {
    *count += by;
  } else {
    map.insert(value.clone(), by);
  }
}

impl<T: Item> ItemTally<T> {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn record_produced(&mut self, value: &T) {
    bump(&mut self.produced, value, 1);
  }

  #[inline]
  pub fn record_consumed(&mut self, value: &T) {
    bump(&mut self.consumed, value, 1);
  }

  /// How many times `value` was enqueued.
  pub fn produced(&self, value: &T) -> u64 {
    self.produced.get(value).copied().unwrap_or(0)
  }

  /// How many times `value` was dequeued.
  pub fn consumed(&self, value: &T) -> u64 {
    self.consumed.get(value).copied().unwrap_or(0)
  }

  pub fn total_produced(&self) -> u64 {
    self.produced.values().sum()
  }

  pub fn total_consumed(&self) -> u64 {
    self.consumed.values().sum()
  }

  /// Every value seen on either side, each once.
  pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
    let mut seen = HashSet::with_capacity(self.produced.len());
    self
      .produced
      .keys()
      .chain(self.consumed.keys())
      .filter(move |v| seen.insert(*v))
  }

  pub fn is_empty(&self) -> bool {
    self.produced.is_empty() && self.consumed.is_empty()
  }

  /// Folds another (partial) tally into this one.
  pub fn merge(&mut self, other: ItemTally<T>) {
    for (value, count) in other.produced {
      match self.produced.entry(value) {
        Entry::Occupied(mut e) => *e.get_mut() += count,
        Entry::Vacant(e) => {
          e.insert(count);
        }
      }
    }
    for (value, count) in other.consumed {
      match self.consumed.entry(value) {
        Entry::Occupied(mut e) => *e.get_mut() += count,
        Entry::Vacant(e) => {
          e.insert(count);
        }
      }
    }
  }
}

impl<T: Item> FromIterator<ItemTally<T>> for ItemTally<T> {
  fn from_iter<I: IntoIterator<Item = ItemTally<T>>>(iter: I) -> Self {
    let mut merged = ItemTally::new();
    for partial in iter {
      merged.merge(partial);
    }
    merged
  }
}
