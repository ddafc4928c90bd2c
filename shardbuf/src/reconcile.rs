//! Post-run verification of produced against consumed counts.

use std::fmt;

use tracing::{info, warn};

use crate::tally::{Item, ItemTally};

/// A value whose produced and consumed counts disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch<T> {
  pub value: T,
  pub produced: u64,
  pub consumed: u64,
}

impl<T: fmt::Debug> fmt::Display for Mismatch<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "item {:?}: produced {}, consumed {}",
      self.value, self.produced, self.consumed
    )
  }
}

/// Compares produced and consumed counts for every value in `tally`.
///
/// Returns the offending values in ascending order; an empty list means the
/// run balanced. Only meaningful once every worker has joined.
pub fn verify<T: Item + Ord>(tally: &ItemTally<T>) -> Vec<Mismatch<T>> {
  let mut mismatches: Vec<Mismatch<T>> = tally
    .values()
    .filter_map(|value| {
      let produced = tally.produced(value);
      let consumed = tally.consumed(value);
      (produced != consumed).then(|| Mismatch {
        value: value.clone(),
        produced,
        consumed,
      })
    })
    .collect();
  mismatches.sort_unstable_by(|a, b| a.value.cmp(&b.value));
  mismatches
}

/// The outcome of reconciling a finished run. Mismatches are data, not
/// errors; a run with mismatches still completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation<T> {
  mismatches: Vec<Mismatch<T>>,
  produced: u64,
  consumed: u64,
}

impl<T: Item + Ord> Reconciliation<T> {
  pub fn of(tally: &ItemTally<T>) -> Self {
    Self {
      mismatches: verify(tally),
      produced: tally.total_produced(),
      consumed: tally.total_consumed(),
    }
  }
}

impl<T: Item> Reconciliation<T> {
  pub fn is_balanced(&self) -> bool {
    self.mismatches.is_empty()
  }

  pub fn mismatches(&self) -> &[Mismatch<T>] {
    &self.mismatches
  }

  pub fn into_mismatches(self) -> Vec<Mismatch<T>> {
    self.mismatches
  }

  pub fn total_produced(&self) -> u64 {
    self.produced
  }

  pub fn total_consumed(&self) -> u64 {
    self.consumed
  }

  /// Emits one `warn` per offending value, or a single `info` if balanced.
  pub fn log(&self) {
    if self.is_balanced() {
      info!(
        produced = self.produced,
        consumed = self.consumed,
        "reconciliation balanced"
      );
      return;
    }
    for m in &self.mismatches {
      warn!(value = ?m.value, produced = m.produced, consumed = m.consumed, "mismatch found");
    }
  }
}
