use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::modules::engine::{Control, Plugin, StateView};
use crate::modules::types::{Addr, StateId};

/// A decode point: call kind, the address whose code runs, and the program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisitKey {
  pub is_create: bool,
  pub code_address: Addr,
  pub pc: usize,
}

impl fmt::Display for VisitKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = if self.is_create { "create" } else { "call" };
    write!(f, "{}@{}:{}", kind, self.code_address, self.pc)
  }
}

/// Who shares a visit counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
  /// One table for every state of the run. States explored in parallel share increments, so
  /// which of several states on the same key crosses the threshold depends on scheduling.
  #[default]
  Global,
  /// One table per exploration state; forks start from a copy of their parent's table.
  PerPath,
}

impl FromStr for CounterScope {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "global" => Ok(CounterScope::Global),
      "path" | "per_path" | "per-path" => Ok(CounterScope::PerPath),
      other => Err(format!("unknown counter scope `{}` (expected `global` or `path`)", other)),
    }
  }
}

type Counts = HashMap<VisitKey, usize>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Abandons a state once one decode point has been visited more than `threshold` times in the
/// current run.
#[derive(Debug)]
pub struct DepthLimiter {
  threshold: usize,
  scope: CounterScope,
  global: Mutex<Counts>,
  paths: Mutex<HashMap<StateId, Counts>>,
}

impl DepthLimiter {
  pub fn new(threshold: usize) -> Self {
    DepthLimiter::with_scope(threshold, CounterScope::Global)
  }

  pub fn with_scope(threshold: usize, scope: CounterScope) -> Self {
    DepthLimiter { threshold, scope, global: Mutex::new(HashMap::new()), paths: Mutex::new(HashMap::new()) }
  }

  /// Visits recorded for `key` in the shared table.
  pub fn visits(&self, key: &VisitKey) -> usize {
    lock(&self.global).get(key).copied().unwrap_or(0)
  }

  /// Visits recorded for `key` along the path of `state`. Only populated under `PerPath`.
  pub fn path_visits(&self, state: StateId, key: &VisitKey) -> usize {
    lock(&self.paths).get(&state).and_then(|c| c.get(key)).copied().unwrap_or(0)
  }

  fn bump(&self, state: StateId, key: VisitKey) -> usize {
    match self.scope {
      CounterScope::Global => {
        let mut counts = lock(&self.global);
        let n = counts.entry(key).or_insert(0);
        *n += 1;
        *n
      }
      CounterScope::PerPath => {
        let mut paths = lock(&self.paths);
        let n = paths.entry(state).or_default().entry(key).or_insert(0);
        *n += 1;
        *n
      }
    }
  }
}

impl Plugin for DepthLimiter {
  fn on_run_start(&self) {
    lock(&self.global).clear();
    lock(&self.paths).clear();
  }

  fn on_instruction_decode(&self, state: &dyn StateView, pc: usize) -> Control {
    let Some(tx) = state.current_tx() else {
      return Control::Continue;
    };
    let key = VisitKey { is_create: tx.is_create, code_address: tx.code_address, pc };
    let count = self.bump(state.id(), key);
    if count > self.threshold {
      debug!("abandoning state {}: {} visited {} times (threshold {})", state.id(), key, count, self.threshold);
      if self.scope == CounterScope::PerPath {
        lock(&self.paths).remove(&state.id());
      }
      Control::Abandon
    } else {
      Control::Continue
    }
  }

  fn on_state_fork(&self, parent: StateId, child: StateId) {
    if self.scope != CounterScope::PerPath {
      return;
    }
    let mut paths = lock(&self.paths);
    let inherited = paths.get(&parent).cloned().unwrap_or_default();
    paths.insert(child, inherited);
  }
}
