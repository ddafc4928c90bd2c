// examples/producer_consumer.rs
//
// Runs the engine from `shardbuf.yaml` (or the path given as the first
// argument), then prints the elapsed time and any produced/consumed mismatch.
use std::path::PathBuf;
use std::process::ExitCode;

use shardbuf::config::find_config_file;
use shardbuf::telemetry::init_logging;
use shardbuf::{coordinator, Config, RunError};

fn load_config() -> Result<Config, RunError> {
  let path = match std::env::args().nth(1) {
    Some(arg) => Some(PathBuf::from(arg)),
    None => find_config_file(None).ok(),
  };
  let config = match path {
    Some(path) => {
      println!("Loading configuration from {}", path.display());
      Config::from_file(&path)?
    }
    None => {
      println!("No configuration file found, using defaults");
      Config::from_yaml_str("")?
    }
  };
  Ok(config)
}

fn main() -> ExitCode {
  let config = match load_config() {
    Ok(config) => config,
    Err(e) => {
      eprintln!("Configuration error: {}", e);
      return ExitCode::FAILURE;
    }
  };
  if let Err(e) = init_logging(&config.logging) {
    eprintln!("Logging disabled: {}", e);
  }

  let run = &config.run;
  println!(
    "--- {} shard(s) x {} slot(s), {} pair(s), {} item(s) ---",
    run.shards, run.capacity_per_shard, run.worker_pairs, run.total_items
  );

  let report = match coordinator::run(config.run.clone()) {
    Ok(report) => report,
    Err(e) => {
      eprintln!("Run failed: {}", e);
      return ExitCode::FAILURE;
    }
  };

  let reconciliation = report.reconcile();
  reconciliation.log();
  for mismatch in reconciliation.mismatches() {
    println!("Mismatch found for {}", mismatch);
  }
  println!(
    "Produced {}, consumed {}",
    reconciliation.total_produced(),
    reconciliation.total_consumed()
  );
  println!("Total time taken: {:.6} seconds", report.elapsed.as_secs_f64());

  // Mismatches are reported, not fatal.
  ExitCode::SUCCESS
}
