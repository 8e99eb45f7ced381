use serde::Deserialize;
use std::path::PathBuf;

use crate::modules::limiter::CounterScope;

/// Run-wide settings. Scenario files may carry a `config` object with any subset of these
/// fields; command-line flags are applied on top.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Visits of one (create flag, code address, pc) allowed before a state is abandoned.
  pub threshold: usize,
  pub counter_scope: CounterScope,
  /// Worker threads stepping live states; at least one is always used.
  pub workers: usize,
  pub solver: String,
  /// Per-query solver timeout in seconds.
  pub solver_timeout: Option<u64>,
  pub dump_queries: bool,
  pub query_dir: PathBuf,
  pub max_call_depth: usize,
  /// Keep reverted states in the live set instead of dropping them.
  pub keep_reverted: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      threshold: 5,
      counter_scope: CounterScope::Global,
      workers: num_cpus::get(),
      solver: "z3".to_string(),
      solver_timeout: None,
      dump_queries: false,
      query_dir: PathBuf::from(".rhoguard"),
      max_call_depth: 16,
      keep_reverted: false,
    }
  }
}

impl Config {
  pub fn worker_count(&self) -> usize {
    self.workers.max(1)
  }
}
