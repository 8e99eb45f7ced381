mod common;

use std::sync::Arc;

use common::{addr, Enumerator, SPIN, SPIN_LOOP_PC};
use rhoguard::modules::asm::assemble;
use rhoguard::modules::effects::Config;
use rhoguard::modules::engine::{Engine, Transaction, TxArg};
use rhoguard::modules::explorer::Explorer;
use rhoguard::modules::invariant::{exists, for_all, Predicate};
use rhoguard::modules::limiter::{CounterScope, DepthLimiter, VisitKey};
use rhoguard::modules::solvers::{CheckSatResult, Solver, SolverError};
use rhoguard::modules::types::{Expr, Prop, W256};

const SPINNER: u64 = 0x5917;
const ALICE: u64 = 0xa11ce;

fn setup(threshold: usize, scope: CounterScope) -> (Explorer<Enumerator>, Arc<DepthLimiter>) {
  let config = Config { threshold, counter_scope: scope, workers: 2, ..Config::default() };
  let limiter = Arc::new(DepthLimiter::with_scope(threshold, scope));
  let mut explorer = Explorer::new(config, Enumerator);
  explorer.register_plugin(limiter.clone());
  explorer.create_account(addr(ALICE));
  explorer.install_runtime(addr(SPINNER), assemble(SPIN).unwrap()).unwrap();
  (explorer, limiter)
}

fn spin(arg: TxArg) -> Transaction {
  Transaction { caller: addr(ALICE), to: addr(SPINNER), signature: "spin(uint256)".to_string(), args: vec![arg] }
}

fn loop_head() -> VisitKey {
  VisitKey { is_create: false, code_address: addr(SPINNER), pc: SPIN_LOOP_PC }
}

fn stored_counts(explorer: &Explorer<Enumerator>) -> Vec<W256> {
  explorer
    .live_states()
    .iter()
    .map(|s| match explorer.read_storage(s, addr(SPINNER), W256::ZERO) {
      Expr::Lit(w) => w,
      other => panic!("expected a concrete count, got {}", other),
    })
    .collect()
}

#[test]
fn test_loop_under_threshold_completes() {
  let (mut explorer, limiter) = setup(3, CounterScope::Global);
  let summary = explorer.transact(&spin(TxArg::Word(W256::from_u64(2)))).unwrap();
  assert_eq!(summary.completed, 1);
  assert_eq!(summary.abandoned, 0);
  assert_eq!(limiter.visits(&loop_head()), 3);
  assert_eq!(stored_counts(&explorer), vec![W256::from_u64(2)]);
}

#[test]
fn test_visit_past_threshold_abandons_and_empties_state_set() {
  let (mut explorer, limiter) = setup(2, CounterScope::Global);
  let summary = explorer.transact(&spin(TxArg::Word(W256::from_u64(5)))).unwrap();
  assert_eq!(summary.abandoned, 1);
  assert_eq!(summary.completed, 0);
  assert_eq!(limiter.visits(&loop_head()), 3);
  assert!(explorer.live_states().is_empty());

  // nothing left to quantify over
  for p in [Predicate::IsTrue, Predicate::IsFalse, Predicate::Eq(W256::from_u64(5))] {
    assert!(for_all(&explorer, addr(SPINNER), W256::ZERO, &p).unwrap());
    assert!(!exists(&explorer, addr(SPINNER), W256::ZERO, &p).unwrap());
  }
}

#[test]
fn test_counters_reset_between_runs() {
  let (mut explorer, limiter) = setup(3, CounterScope::Global);
  for _ in 0..3 {
    let summary = explorer.transact(&spin(TxArg::Word(W256::from_u64(2)))).unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(limiter.visits(&loop_head()), 3);
  }
  assert_eq!(explorer.live_states().len(), 1);
}

#[test]
fn test_symbolic_loop_is_cut_at_threshold() {
  let (mut explorer, _) = setup(3, CounterScope::Global);
  let summary = explorer.transact(&spin(TxArg::Symbolic)).unwrap();
  assert_eq!(summary.completed, 3);
  assert_eq!(summary.abandoned, 1);
  assert_eq!(summary.forks, 3);

  let mut counts = stored_counts(&explorer);
  counts.sort();
  assert_eq!(counts, vec![W256::from_u64(0), W256::from_u64(1), W256::from_u64(2)]);

  let spinner = addr(SPINNER);
  assert!(for_all(&explorer, spinner, W256::ZERO, &Predicate::Le(W256::from_u64(2))).unwrap());
  assert!(exists(&explorer, spinner, W256::ZERO, &Predicate::Eq(W256::ZERO)).unwrap());
  assert!(!exists(&explorer, spinner, W256::ZERO, &Predicate::Eq(W256::from_u64(3))).unwrap());
}

#[test]
fn test_per_path_counters_follow_each_branch() {
  let (mut explorer, limiter) = setup(3, CounterScope::PerPath);
  let summary = explorer.transact(&spin(TxArg::Symbolic)).unwrap();
  assert_eq!(summary.completed, 3);
  assert_eq!(summary.abandoned, 1);
  // the global table is untouched under per-path counting
  assert_eq!(limiter.visits(&loop_head()), 0);
  for state in explorer.live_states() {
    assert!(limiter.path_visits(state.id, &loop_head()) <= 3);
  }
}

/// Answers every query with `Inconclusive`.
struct Undecided;

impl Solver for Undecided {
  fn check_sat(&self, _props: &[Prop]) -> Result<CheckSatResult, SolverError> {
    Err(SolverError::Inconclusive)
  }

  fn get_value(&self, _props: &[Prop], _expr: &Expr) -> Result<Option<W256>, SolverError> {
    Err(SolverError::Inconclusive)
  }
}

#[test]
fn test_failed_run_keeps_previous_states() {
  let config = Config { threshold: 3, workers: 2, ..Config::default() };
  let limiter = Arc::new(DepthLimiter::new(3));
  let mut explorer = Explorer::new(config, Undecided);
  explorer.register_plugin(limiter);
  explorer.create_account(addr(ALICE));
  explorer.install_runtime(addr(SPINNER), assemble(SPIN).unwrap()).unwrap();

  // concrete loop bounds never reach the solver
  let summary = explorer.transact(&spin(TxArg::Word(W256::from_u64(1)))).unwrap();
  assert_eq!(summary.completed, 1);
  let before: Vec<_> = explorer.live_states().iter().map(|s| s.id).collect();

  assert!(explorer.transact(&spin(TxArg::Symbolic)).is_err());
  let after: Vec<_> = explorer.live_states().iter().map(|s| s.id).collect();
  assert_eq!(after, before);
  let count = explorer.read_storage(&explorer.live_states()[0], addr(SPINNER), W256::ZERO);
  assert_eq!(count, Expr::Lit(W256::ONE));
  assert!(!for_all(&explorer, addr(SPINNER), W256::ZERO, &Predicate::Eq(W256::from_u64(12345))).unwrap());
}

#[test]
fn test_live_states_are_ordered_by_id() {
  let (mut explorer, _) = setup(3, CounterScope::Global);
  explorer.transact(&spin(TxArg::Symbolic)).unwrap();
  let ids: Vec<_> = explorer.live_states().iter().map(|s| s.id).collect();
  let mut sorted = ids.clone();
  sorted.sort();
  assert_eq!(ids, sorted);
}
