mod common;

use std::path::Path;
use std::sync::Arc;

use common::{addr, Enumerator, OBSERVER, REGISTRY};
use rhoguard::modules::asm::assemble;
use rhoguard::modules::effects::Config;
use rhoguard::modules::engine::{Engine, RunSummary, StateView, Transaction, TxArg};
use rhoguard::modules::explorer::Explorer;
use rhoguard::modules::invariant::{counterexample, exists, for_all, probe, Predicate, Witness};
use rhoguard::modules::limiter::DepthLimiter;
use rhoguard::modules::scenario;
use rhoguard::modules::solvers::{can_be_true, solve_value, SolverError};
use rhoguard::modules::types::{Addr, CallContext, Expr, Prop, StateId, W256};

struct Fixed {
  id: StateId,
  value: Expr,
  constraints: Vec<Prop>,
}

impl StateView for Fixed {
  fn id(&self) -> StateId {
    self.id
  }

  fn current_tx(&self) -> Option<CallContext> {
    None
  }
}

/// Engine over hand-built states whose every storage slot reads as `value`.
struct Snapshot(Vec<Fixed>);

impl Engine for Snapshot {
  type State = Fixed;
  type Error = SolverError;

  fn live_states(&self) -> &[Fixed] {
    &self.0
  }

  fn read_storage(&self, state: &Fixed, _address: Addr, _slot: W256) -> Expr {
    state.value.clone()
  }

  fn can_be_true(&self, state: &Fixed, prop: &Prop) -> Result<bool, SolverError> {
    can_be_true(&Enumerator, &state.constraints, prop)
  }

  fn solve_one(&self, state: &Fixed, expr: &Expr, extra: &[Prop]) -> Result<Option<W256>, SolverError> {
    let mut props = state.constraints.clone();
    props.extend_from_slice(extra);
    solve_value(&Enumerator, &props, expr)
  }

  fn transact(&mut self, _tx: &Transaction) -> Result<RunSummary, SolverError> {
    Ok(RunSummary::default())
  }
}

fn w(n: u64) -> W256 {
  W256::from_u64(n)
}

fn predicates() -> Vec<Predicate> {
  vec![
    Predicate::IsTrue,
    Predicate::IsFalse,
    Predicate::Eq(w(1)),
    Predicate::Ne(w(7)),
    Predicate::Lt(w(3)),
    Predicate::Ge(w(2)),
    Predicate::All(vec![Predicate::Gt(w(0)), Predicate::Le(w(2))]),
    Predicate::Any(vec![Predicate::Eq(w(0)), Predicate::Eq(w(9))]),
    Predicate::All(vec![]),
    Predicate::Any(vec![]),
  ]
}

fn mixed_states() -> Snapshot {
  let x = Expr::var("x");
  let y = Expr::var("y");
  Snapshot(vec![
    Fixed { id: StateId(0), value: Expr::lit(1), constraints: vec![] },
    Fixed { id: StateId(1), value: x.clone(), constraints: vec![Prop::PLT(x, Expr::lit(3))] },
    Fixed {
      id: StateId(2),
      value: Expr::ITE(
        Box::new(Expr::Eq(Box::new(y), Box::new(Expr::lit(7)))),
        Box::new(Expr::lit(1)),
        Box::new(Expr::lit(0)),
      ),
      constraints: vec![],
    },
  ])
}

#[test]
fn test_empty_state_set_is_vacuous() {
  let engine = Snapshot(vec![]);
  for p in predicates() {
    assert!(for_all(&engine, addr(1), W256::ZERO, &p).unwrap(), "forall {}", p);
    assert!(!exists(&engine, addr(1), W256::ZERO, &p).unwrap(), "exists {}", p);
    assert_eq!(counterexample(&engine, addr(1), W256::ZERO, &p).unwrap(), None);
  }
}

#[test]
fn test_forall_is_dual_of_exists() {
  let zero = Fixed { id: StateId(4), value: Expr::lit(0), constraints: vec![] };
  let engines = [mixed_states(), Snapshot(vec![]), Snapshot(vec![zero])];
  for engine in &engines {
    for p in predicates() {
      let all = for_all(engine, addr(1), W256::ZERO, &p).unwrap();
      let none_fail = !exists(engine, addr(1), W256::ZERO, &p.negate()).unwrap();
      assert_eq!(all, none_fail, "predicate {}", p);
    }
  }
}

#[test]
fn test_quantifiers_over_mixed_states() {
  let engine = mixed_states();
  let slot = W256::ZERO;
  // x < 3 lets state 1 reach 0, 1 and 2
  assert!(!for_all(&engine, addr(1), slot, &Predicate::IsTrue).unwrap());
  assert!(for_all(&engine, addr(1), slot, &Predicate::Lt(w(3))).unwrap());
  assert!(exists(&engine, addr(1), slot, &Predicate::Eq(w(2))).unwrap());
  assert!(!exists(&engine, addr(1), slot, &Predicate::Eq(w(3))).unwrap());

  let witness = counterexample(&engine, addr(1), slot, &Predicate::IsTrue).unwrap();
  assert_eq!(witness, Some(Witness { state: StateId(1), value: W256::ZERO }));
  assert_eq!(counterexample(&engine, addr(1), slot, &Predicate::Lt(w(3))).unwrap(), None);
}

const REGISTRY_AT: u64 = 0x7e6157e7;
const OBSERVER_AT: u64 = 0x0b5e77e7;
const ALICE: u64 = 0xa11ce;

fn registry_explorer() -> Explorer<Enumerator> {
  let config = Config { workers: 1, ..Config::default() };
  let mut explorer = Explorer::new(config, Enumerator);
  explorer.register_plugin(Arc::new(DepthLimiter::new(5)));
  explorer.create_account(addr(ALICE));
  explorer.install_runtime(addr(REGISTRY_AT), assemble(REGISTRY).unwrap()).unwrap();
  explorer.install_runtime(addr(OBSERVER_AT), assemble(OBSERVER).unwrap()).unwrap();
  explorer
}

fn call(explorer: &mut Explorer<Enumerator>, signature: &str, who: u64) -> RunSummary {
  let tx = Transaction {
    caller: addr(ALICE),
    to: addr(REGISTRY_AT),
    signature: signature.to_string(),
    args: vec![TxArg::Word(addr(who))],
  };
  explorer.transact(&tx).unwrap()
}

fn check(explorer: &mut Explorer<Enumerator>, who: TxArg) -> RunSummary {
  probe(explorer, addr(OBSERVER_AT), "check(address,address)", addr(REGISTRY_AT), who, addr(ALICE)).unwrap()
}

#[test]
fn test_probe_registry_membership() {
  let mut explorer = registry_explorer();
  let (observer, slot) = (addr(OBSERVER_AT), W256::ZERO);

  assert_eq!(call(&mut explorer, "register(address)", ALICE).completed, 1);

  let summary = check(&mut explorer, TxArg::Symbolic);
  assert_eq!((summary.completed, summary.forks), (1, 0));
  assert!(exists(&explorer, observer, slot, &Predicate::IsTrue).unwrap());
  assert!(!for_all(&explorer, observer, slot, &Predicate::IsTrue).unwrap());
  let witness = counterexample(&explorer, observer, slot, &Predicate::IsTrue).unwrap();
  assert_eq!(witness.map(|w| w.value), Some(W256::ZERO));

  check(&mut explorer, TxArg::Word(addr(ALICE)));
  assert!(for_all(&explorer, observer, slot, &Predicate::IsTrue).unwrap());
  assert!(for_all(&explorer, observer, slot, &Predicate::Eq(W256::ONE)).unwrap());

  assert_eq!(call(&mut explorer, "unregister(address)", ALICE).completed, 1);
  check(&mut explorer, TxArg::Symbolic);
  assert!(!exists(&explorer, observer, slot, &Predicate::IsTrue).unwrap());
  assert!(for_all(&explorer, observer, slot, &Predicate::IsFalse).unwrap());
}

#[test]
fn test_unknown_selector_reverts_and_drops_state() {
  let mut explorer = registry_explorer();
  let summary = call(&mut explorer, "transfer(address)", ALICE);
  assert_eq!((summary.completed, summary.reverted), (0, 1));
  assert!(explorer.live_states().is_empty());
  // later probes run over nothing
  assert_eq!(check(&mut explorer, TxArg::Symbolic), RunSummary { run: 2, ..RunSummary::default() });
  assert!(for_all(&explorer, addr(OBSERVER_AT), W256::ZERO, &Predicate::IsFalse).unwrap());
}

#[test]
fn test_keep_reverted_retains_state() {
  let config = Config { keep_reverted: true, ..Config::default() };
  let mut explorer = Explorer::new(config, Enumerator);
  explorer.install_runtime(addr(REGISTRY_AT), assemble(REGISTRY).unwrap()).unwrap();
  let summary = call(&mut explorer, "transfer(address)", ALICE);
  assert_eq!(summary.reverted, 1);
  assert_eq!(explorer.live_states().len(), 1);
}

#[test]
fn test_demo_scenario_passes() {
  let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/registry.json");
  let scenario = scenario::load(&path).unwrap();
  let mut explorer = scenario::prepare(scenario.config.clone(), Enumerator);
  let report = scenario::run(&scenario, &mut explorer).unwrap();
  assert!(report.passed(), "violations: {:?}", report.violations);
  assert_eq!(report.assertions, 7);
  // three deployments, then one run per transact or probe step
  assert_eq!(report.runs.len(), 3 + 6);
  let spin = report.runs.last().unwrap();
  assert_eq!((spin.completed, spin.abandoned), (3, 1));
}

#[test]
fn test_failed_assertion_is_reported_with_witness() {
  let json = format!(
    r#"{{
      "accounts": {{"alice": "{alice}"}},
      "contracts": [
        {{"name": "registry", "address": "{registry}", "runtime": "{registry_code}"}},
        {{"name": "observer", "address": "{observer}", "runtime": "{observer_code}"}}
      ],
      "steps": [
        {{"step": "transact", "caller": "alice", "to": "registry", "signature": "register(address)", "args": ["alice"]}},
        {{"step": "probe", "observer": "observer", "method": "check(address,address)", "target": "registry", "argument": "symbolic", "caller": "alice"}},
        {{"step": "assert", "quantifier": "forall", "contract": "observer", "predicate": "is_true"}},
        {{"step": "assert", "quantifier": "exists", "contract": "observer", "predicate": "is_true", "expect": false}}
      ]
    }}"#,
    alice = addr(ALICE),
    registry = addr(REGISTRY_AT),
    observer = addr(OBSERVER_AT),
    registry_code = hex::encode(assemble(REGISTRY).unwrap()),
    observer_code = hex::encode(assemble(OBSERVER).unwrap()),
  );
  let scenario: scenario::Scenario = serde_json::from_str(&json).unwrap();
  let mut explorer = scenario::prepare(scenario.config.clone(), Enumerator);
  let report = scenario::run(&scenario, &mut explorer).unwrap();
  assert_eq!(report.assertions, 2);
  assert_eq!(report.violations.len(), 2);

  let (first, second) = (&report.violations[0], &report.violations[1]);
  assert_eq!(first.step, 3);
  assert_eq!(first.witness, Some(Witness { state: StateId(0), value: W256::ZERO }));
  assert_eq!(second.step, 4);
  assert_eq!(second.witness, Some(Witness { state: StateId(0), value: W256::ONE }));
}

#[test]
#[ignore = "requires z3 on PATH"]
fn test_demo_scenario_with_z3() {
  let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/registry.json");
  let scenario = scenario::load(&path).unwrap();
  let report = scenario::run_scenario(&scenario, scenario.config.clone()).unwrap();
  assert!(report.passed(), "violations: {:?}", report.violations);
}
