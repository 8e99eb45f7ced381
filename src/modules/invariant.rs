use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::modules::engine::{Engine, RunSummary, StateView, Transaction, TxArg};
use crate::modules::types::{Addr, Expr, Prop, StateId, W256};

/// A condition on one 256-bit storage word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
  Eq(W256),
  Ne(W256),
  Lt(W256),
  Le(W256),
  Gt(W256),
  Ge(W256),
  /// Non-zero.
  IsTrue,
  IsFalse,
  Not(Box<Predicate>),
  All(Vec<Predicate>),
  Any(Vec<Predicate>),
}

impl Predicate {
  pub fn to_prop(&self, value: &Expr) -> Prop {
    let v = || value.clone();
    match self {
      Predicate::Eq(w) => Prop::PEq(v(), Expr::Lit(*w)),
      Predicate::Ne(w) => Prop::PNeg(Box::new(Prop::PEq(v(), Expr::Lit(*w)))),
      Predicate::Lt(w) => Prop::PLT(v(), Expr::Lit(*w)),
      Predicate::Le(w) => Prop::PLEq(v(), Expr::Lit(*w)),
      Predicate::Gt(w) => Prop::PGT(v(), Expr::Lit(*w)),
      Predicate::Ge(w) => Prop::PGEq(v(), Expr::Lit(*w)),
      Predicate::IsTrue => Prop::PNeg(Box::new(Prop::PEq(v(), Expr::Lit(W256::ZERO)))),
      Predicate::IsFalse => Prop::PEq(v(), Expr::Lit(W256::ZERO)),
      Predicate::Not(p) => Prop::PNeg(Box::new(p.to_prop(value))),
      Predicate::All(ps) => ps
        .iter()
        .map(|p| p.to_prop(value))
        .reduce(|a, b| Prop::PAnd(Box::new(a), Box::new(b)))
        .unwrap_or(Prop::PBool(true)),
      Predicate::Any(ps) => ps
        .iter()
        .map(|p| p.to_prop(value))
        .reduce(|a, b| Prop::POr(Box::new(a), Box::new(b)))
        .unwrap_or(Prop::PBool(false)),
    }
  }

  pub fn negate(&self) -> Predicate {
    Predicate::Not(Box::new(self.clone()))
  }
}

impl fmt::Display for Predicate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let join = |ps: &[Predicate], sep: &str| ps.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(sep);
    match self {
      Predicate::Eq(w) => write!(f, "== {}", w),
      Predicate::Ne(w) => write!(f, "!= {}", w),
      Predicate::Lt(w) => write!(f, "< {}", w),
      Predicate::Le(w) => write!(f, "<= {}", w),
      Predicate::Gt(w) => write!(f, "> {}", w),
      Predicate::Ge(w) => write!(f, ">= {}", w),
      Predicate::IsTrue => write!(f, "is true"),
      Predicate::IsFalse => write!(f, "is false"),
      Predicate::Not(p) => write!(f, "not ({})", p),
      Predicate::All(ps) => write!(f, "all ({})", join(ps, ", ")),
      Predicate::Any(ps) => write!(f, "any ({})", join(ps, ", ")),
    }
  }
}

/// A state in which a predicate fails, with one value of the slot that makes it fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Witness {
  pub state: StateId,
  pub value: W256,
}

/// Calls `method(target, argument)` on `observer` in every live state so that the observer
/// records the result in its own storage.
pub fn probe<E: Engine>(
  engine: &mut E,
  observer: Addr,
  method: &str,
  target: Addr,
  argument: TxArg,
  caller: Addr,
) -> Result<RunSummary, E::Error> {
  let tx =
    Transaction { caller, to: observer, signature: method.to_string(), args: vec![TxArg::Word(target), argument] };
  debug!("probe: {}", tx);
  engine.transact(&tx)
}

/// True when no live state can make `slot` of `observer` violate `predicate`. Vacuously true
/// when nothing is live.
pub fn for_all<E: Engine>(engine: &E, observer: Addr, slot: W256, predicate: &Predicate) -> Result<bool, E::Error> {
  let states = engine.live_states();
  if states.is_empty() {
    warn!("forall `{}` over an empty state set is vacuously true; the depth limit may have pruned every path", predicate);
    return Ok(true);
  }
  let negated = predicate.negate();
  for state in states {
    let value = engine.read_storage(state, observer, slot);
    if engine.can_be_true(state, &negated.to_prop(&value))? {
      debug!("forall `{}` fails in state {}", predicate, state.id());
      return Ok(false);
    }
  }
  Ok(true)
}

/// True when some live state can make `slot` of `observer` satisfy `predicate`. Vacuously false
/// when nothing is live.
pub fn exists<E: Engine>(engine: &E, observer: Addr, slot: W256, predicate: &Predicate) -> Result<bool, E::Error> {
  let states = engine.live_states();
  if states.is_empty() {
    warn!("exists `{}` over an empty state set is vacuously false; the depth limit may have pruned every path", predicate);
    return Ok(false);
  }
  for state in states {
    let value = engine.read_storage(state, observer, slot);
    if engine.can_be_true(state, &predicate.to_prop(&value))? {
      debug!("exists `{}` holds in state {}", predicate, state.id());
      return Ok(true);
    }
  }
  Ok(false)
}

/// The first live state able to falsify `predicate`, with a concrete falsifying slot value.
pub fn counterexample<E: Engine>(
  engine: &E,
  observer: Addr,
  slot: W256,
  predicate: &Predicate,
) -> Result<Option<Witness>, E::Error> {
  let negated = predicate.negate();
  for state in engine.live_states() {
    let value = engine.read_storage(state, observer, slot);
    if let Some(w) = engine.solve_one(state, &value, &[negated.to_prop(&value)])? {
      return Ok(Some(Witness { state: state.id(), value: w }));
    }
  }
  Ok(None)
}
