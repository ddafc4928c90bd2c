// src/config.rs
//! Run and logging configuration.
//!
//! YAML maps onto the `*Raw` structs (serde, unknown fields rejected), which
//! are then validated into [`RunConfig`] and [`LoggingConfig`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

use crate::error::ConfigError;

const DEFAULT_CONFIG_BASE_NAME: &str = "shardbuf";
const DEFAULT_CONFIG_EXTENSION: &str = "yaml";

/// What to do with `total_items % worker_pairs` leftover items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
  /// The first `total_items % worker_pairs` pairs each move one extra item.
  #[default]
  Distribute,
  /// Refuse configurations where the pairs cannot split the work evenly.
  Reject,
  /// Drop the leftover items; fewer than `total_items` are moved.
  Truncate,
}

// --- Raw (as written in YAML) ---

#[derive(Debug, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigRaw {
  #[serde(default)]
  pub run: RunConfigRaw,
  #[serde(default)]
  pub logging: LoggingConfigRaw,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfigRaw {
  #[serde(default = "default_shards")]
  pub shards: usize,
  #[serde(default = "default_capacity")]
  pub capacity_per_shard: usize,
  #[serde(default = "default_total_items")]
  pub total_items: usize,
  #[serde(default = "default_worker_pairs")]
  pub worker_pairs: usize,
  #[serde(default)]
  pub remainder: RemainderPolicy,
  #[serde(default = "default_value_range")]
  pub value_range: u64,
  #[serde(default)]
  pub seed: Option<u64>,
  #[serde(default)]
  pub deadline_ms: Option<u64>,
}

impl Default for RunConfigRaw {
  fn default() -> Self {
    Self {
      shards: default_shards(),
      capacity_per_shard: default_capacity(),
      total_items: default_total_items(),
      worker_pairs: default_worker_pairs(),
      remainder: RemainderPolicy::default(),
      value_range: default_value_range(),
      seed: None,
      deadline_ms: None,
    }
  }
}

fn default_shards() -> usize {
  1
}
fn default_capacity() -> usize {
  8
}
fn default_total_items() -> usize {
  80
}
fn default_worker_pairs() -> usize {
  4
}
fn default_value_range() -> u64 {
  100
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfigRaw {
  #[serde(default = "default_level")]
  pub level: String,
  #[serde(default)]
  pub format: LogFormat,
}

impl Default for LoggingConfigRaw {
  fn default() -> Self {
    Self {
      level: default_level(),
      format: LogFormat::default(),
    }
  }
}

fn default_level() -> String {
  "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
  Full,
  #[default]
  Compact,
  Pretty,
}

// --- Processed ---

/// A validated coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
  pub shards: usize,
  pub capacity_per_shard: usize,
  pub total_items: usize,
  pub worker_pairs: usize,
  pub remainder: RemainderPolicy,
  /// Generated values fall in `[0, value_range)`.
  pub value_range: u64,
  pub seed: u64,
  /// Cancel the run as stalled if it has not finished by then.
  pub deadline: Option<Duration>,
}

impl RunConfig {
  /// Builds a validated configuration with default remainder policy,
  /// value range and no deadline.
  pub fn new(
    shards: usize,
    capacity_per_shard: usize,
    total_items: usize,
    worker_pairs: usize,
  ) -> Result<Self, ConfigError> {
    let config = Self {
      shards,
      capacity_per_shard,
      total_items,
      worker_pairs,
      remainder: RemainderPolicy::default(),
      value_range: default_value_range(),
      seed: clock_seed(),
      deadline: None,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn with_remainder(mut self, remainder: RemainderPolicy) -> Result<Self, ConfigError> {
    self.remainder = remainder;
    self.validate()?;
    Ok(self)
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.shards == 0 {
      return Err(ConfigError::invalid("shards", "must be at least 1"));
    }
    if self.capacity_per_shard == 0 {
      return Err(ConfigError::invalid(
        "capacity_per_shard",
        "must be at least 1",
      ));
    }
    if self.worker_pairs == 0 {
      return Err(ConfigError::invalid("worker_pairs", "must be at least 1"));
    }
    if self.worker_pairs < self.shards {
      return Err(ConfigError::invalid(
        "worker_pairs",
        format!(
          "{} pair(s) cannot serve {} shard(s); every shard needs a producer and a consumer",
          self.worker_pairs, self.shards
        ),
      ));
    }
    if self.value_range == 0 {
      return Err(ConfigError::invalid("value_range", "must be at least 1"));
    }
    if self.remainder == RemainderPolicy::Reject && self.total_items % self.worker_pairs != 0 {
      return Err(ConfigError::invalid(
        "total_items",
        format!(
          "{} item(s) do not divide evenly across {} pair(s)",
          self.total_items, self.worker_pairs
        ),
      ));
    }
    Ok(())
  }

  /// Items moved by each pair, indexed by pair, under the remainder policy.
  pub fn iterations_per_pair(&self) -> Vec<usize> {
    let base = self.total_items / self.worker_pairs;
    let extra = self.total_items % self.worker_pairs;
    (0..self.worker_pairs)
      .map(|pair| match self.remainder {
        RemainderPolicy::Distribute if pair < extra => base + 1,
        _ => base,
      })
      .collect()
  }

  /// Items dropped by `RemainderPolicy::Truncate`; zero otherwise.
  pub fn dropped_items(&self) -> usize {
    match self.remainder {
      RemainderPolicy::Truncate => self.total_items % self.worker_pairs,
      _ => 0,
    }
  }
}

impl TryFrom<RunConfigRaw> for RunConfig {
  type Error = ConfigError;

  fn try_from(raw: RunConfigRaw) -> Result<Self, Self::Error> {
    let config = Self {
      shards: raw.shards,
      capacity_per_shard: raw.capacity_per_shard,
      total_items: raw.total_items,
      worker_pairs: raw.worker_pairs,
      remainder: raw.remainder,
      value_range: raw.value_range,
      seed: raw.seed.unwrap_or_else(clock_seed),
      deadline: raw.deadline_ms.map(Duration::from_millis),
    };
    config.validate()?;
    Ok(config)
  }
}

/// Validated logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
  pub level: LevelFilter,
  pub format: LogFormat,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: LevelFilter::INFO,
      format: LogFormat::default(),
    }
  }
}

impl TryFrom<LoggingConfigRaw> for LoggingConfig {
  type Error = ConfigError;

  fn try_from(raw: LoggingConfigRaw) -> Result<Self, Self::Error> {
    let level = LevelFilter::from_str(raw.level.trim())
      .map_err(|e| ConfigError::invalid("logging.level", format!("'{}': {}", raw.level, e)))?;
    Ok(Self {
      level,
      format: raw.format,
    })
  }
}

/// A complete, validated configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  pub run: RunConfig,
  pub logging: LoggingConfig,
}

impl Config {
  pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
    let raw: ConfigRaw = if yaml.trim().is_empty() {
      ConfigRaw::default()
    } else {
      serde_yaml::from_str(yaml)?
    };
    Ok(Self {
      run: raw.run.try_into()?,
      logging: raw.logging.try_into()?,
    })
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let contents = fs::read_to_string(path)?;
    Self::from_yaml_str(&contents)
  }
}

/// Finds `shardbuf.<env>.yaml` or `shardbuf.yaml` in the working directory.
///
/// `env` falls back to `SHARDBUF_ENV`, then `APP_ENV`.
pub fn find_config_file(environment_suffix: Option<&str>) -> Result<PathBuf, ConfigError> {
  find_config_file_in(Path::new("."), environment_suffix)
}

pub(crate) fn find_config_file_in(
  dir: &Path,
  environment_suffix: Option<&str>,
) -> Result<PathBuf, ConfigError> {
  let env_from_var = environment_suffix
    .map(|s| s.to_string())
    .or_else(|| env::var("SHARDBUF_ENV").ok())
    .or_else(|| env::var("APP_ENV").ok());

  let mut files_to_check: Vec<String> = Vec::new();
  if let Some(env_str) = env_from_var.as_deref().filter(|s| !s.is_empty()) {
    files_to_check.push(format!(
      "{}.{}.{}",
      DEFAULT_CONFIG_BASE_NAME, env_str, DEFAULT_CONFIG_EXTENSION
    ));
  }
  files_to_check.push(format!(
    "{}.{}",
    DEFAULT_CONFIG_BASE_NAME, DEFAULT_CONFIG_EXTENSION
  ));

  for file_name in &files_to_check {
    let path = dir.join(file_name);
    if path.is_file() {
      return Ok(path);
    }
  }

  Err(ConfigError::NotFound(format!(
    "Searched for: {:?} in {:?}. Provide a config file or check SHARDBUF_ENV/APP_ENV.",
    files_to_check, dir
  )))
}

fn clock_seed() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(1)
}
