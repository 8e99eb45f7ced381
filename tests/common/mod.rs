#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use rhoguard::modules::expr::{eval_prop, expr_vars, referenced_vars, simplify};
use rhoguard::modules::solvers::{CheckSatResult, Solver, SolverError};
use rhoguard::modules::types::{Expr, Prop, W256};

pub const REGISTRY: &str = "
  PUSH 0
  CALLDATALOAD
  PUSH 224
  SHR
  DUP1
  SELECTOR register(address)
  EQ
  PUSH @register
  JUMPI
  DUP1
  SELECTOR unregister(address)
  EQ
  PUSH @unregister
  JUMPI
  DUP1
  SELECTOR isRegistered(address)
  EQ
  PUSH @is_registered
  JUMPI
  PUSH 0
  PUSH 0
  REVERT
@register
  PUSH 1
  PUSH 4
  CALLDATALOAD
  SSTORE
  STOP
@unregister
  PUSH 0
  PUSH 4
  CALLDATALOAD
  SSTORE
  STOP
@is_registered
  PUSH 4
  CALLDATALOAD
  SLOAD
  PUSH 0
  MSTORE
  PUSH 32
  PUSH 0
  RETURN
";

/// `check(address registry, address who)` stores `registry.isRegistered(who)` in slot 0.
pub const OBSERVER: &str = "
  SELECTOR isRegistered(address)
  PUSH 224
  SHL
  PUSH 0
  MSTORE
  PUSH 36
  CALLDATALOAD
  PUSH 4
  MSTORE
  PUSH 32
  PUSH 0
  PUSH 36
  PUSH 0
  PUSH 4
  CALLDATALOAD
  GAS
  STATICCALL
  POP
  PUSH 0
  MLOAD
  PUSH 0
  SSTORE
  STOP
";

/// `spin(uint256 n)` counts from 0 up to `n` and stores the final count in slot 0.
pub const SPIN: &str = "
  PUSH 0
@loop
  DUP1
  PUSH 4
  CALLDATALOAD
  GT
  ISZERO
  PUSH @done
  JUMPI
  PUSH 1
  ADD
  PUSH @loop
  JUMP
@done
  PUSH 0
  SSTORE
  STOP
";

/// Offset of the `@loop` label in `SPIN`.
pub const SPIN_LOOP_PC: usize = 2;

pub fn addr(n: u64) -> W256 {
  W256::from_u64(n)
}

/// Decides small queries by trying every assignment drawn from the literals they mention
/// (and their neighbours). Sound for the contracts above, which only compare variables
/// against constants.
pub struct Enumerator;

fn subst(e: &Expr, env: &BTreeMap<String, W256>) -> Expr {
  let b = |x: &Expr| Box::new(subst(x, env));
  match e {
    Expr::Var(name) => env.get(name).map(|w| Expr::Lit(*w)).unwrap_or_else(|| e.clone()),
    Expr::Lit(_) | Expr::ConcreteStore(_) => e.clone(),
    Expr::Add(x, y) => Expr::Add(b(x), b(y)),
    Expr::Sub(x, y) => Expr::Sub(b(x), b(y)),
    Expr::Mul(x, y) => Expr::Mul(b(x), b(y)),
    Expr::Div(x, y) => Expr::Div(b(x), b(y)),
    Expr::Mod(x, y) => Expr::Mod(b(x), b(y)),
    Expr::LT(x, y) => Expr::LT(b(x), b(y)),
    Expr::GT(x, y) => Expr::GT(b(x), b(y)),
    Expr::Eq(x, y) => Expr::Eq(b(x), b(y)),
    Expr::IsZero(x) => Expr::IsZero(b(x)),
    Expr::And(x, y) => Expr::And(b(x), b(y)),
    Expr::Or(x, y) => Expr::Or(b(x), b(y)),
    Expr::Xor(x, y) => Expr::Xor(b(x), b(y)),
    Expr::Not(x) => Expr::Not(b(x)),
    Expr::SHL(x, y) => Expr::SHL(b(x), b(y)),
    Expr::SHR(x, y) => Expr::SHR(b(x), b(y)),
    Expr::ITE(c, t, f) => Expr::ITE(b(c), b(t), b(f)),
    Expr::SStore(k, v, s) => Expr::SStore(b(k), b(v), b(s)),
    Expr::SLoad(k, s) => Expr::SLoad(b(k), b(s)),
  }
}

fn subst_prop(p: &Prop, env: &BTreeMap<String, W256>) -> Prop {
  let b = |x: &Prop| Box::new(subst_prop(x, env));
  match p {
    Prop::PEq(x, y) => Prop::PEq(subst(x, env), subst(y, env)),
    Prop::PLT(x, y) => Prop::PLT(subst(x, env), subst(y, env)),
    Prop::PGT(x, y) => Prop::PGT(subst(x, env), subst(y, env)),
    Prop::PGEq(x, y) => Prop::PGEq(subst(x, env), subst(y, env)),
    Prop::PLEq(x, y) => Prop::PLEq(subst(x, env), subst(y, env)),
    Prop::PNeg(x) => Prop::PNeg(b(x)),
    Prop::PAnd(x, y) => Prop::PAnd(b(x), b(y)),
    Prop::POr(x, y) => Prop::POr(b(x), b(y)),
    Prop::PImpl(x, y) => Prop::PImpl(b(x), b(y)),
    Prop::PBool(_) => p.clone(),
  }
}

fn literals(e: &Expr, acc: &mut BTreeSet<W256>) {
  match e {
    Expr::Lit(w) => {
      acc.insert(*w);
    }
    Expr::Var(_) => {}
    Expr::ConcreteStore(map) => acc.extend(map.keys().copied()),
    Expr::IsZero(x) | Expr::Not(x) => literals(x, acc),
    Expr::Add(x, y)
    | Expr::Sub(x, y)
    | Expr::Mul(x, y)
    | Expr::Div(x, y)
    | Expr::Mod(x, y)
    | Expr::LT(x, y)
    | Expr::GT(x, y)
    | Expr::Eq(x, y)
    | Expr::And(x, y)
    | Expr::Or(x, y)
    | Expr::Xor(x, y)
    | Expr::SHL(x, y)
    | Expr::SHR(x, y)
    | Expr::SLoad(x, y) => {
      literals(x, acc);
      literals(y, acc);
    }
    Expr::ITE(x, y, z) | Expr::SStore(x, y, z) => {
      literals(x, acc);
      literals(y, acc);
      literals(z, acc);
    }
  }
}

fn prop_literals(p: &Prop, acc: &mut BTreeSet<W256>) {
  match p {
    Prop::PEq(x, y) | Prop::PLT(x, y) | Prop::PGT(x, y) | Prop::PGEq(x, y) | Prop::PLEq(x, y) => {
      literals(x, acc);
      literals(y, acc);
    }
    Prop::PNeg(x) => prop_literals(x, acc),
    Prop::PAnd(x, y) | Prop::POr(x, y) | Prop::PImpl(x, y) => {
      prop_literals(x, acc);
      prop_literals(y, acc);
    }
    Prop::PBool(_) => {}
  }
}

impl Enumerator {
  fn candidates(props: &[Prop], extra: Option<&Expr>) -> Vec<W256> {
    let mut lits = BTreeSet::from([W256::ZERO, W256::ONE]);
    for p in props {
      prop_literals(p, &mut lits);
    }
    if let Some(e) = extra {
      literals(e, &mut lits);
    }
    let mut out = BTreeSet::new();
    for l in lits {
      out.insert(l);
      out.insert(l + W256::ONE);
      out.insert(l - W256::ONE);
    }
    out.into_iter().collect()
  }

  /// The first assignment making every prop true.
  fn model(props: &[Prop], extra: Option<&Expr>) -> Option<BTreeMap<String, W256>> {
    let mut vars = referenced_vars(props);
    if let Some(e) = extra {
      expr_vars(e, &mut vars);
    }
    let vars: Vec<String> = vars.into_iter().collect();
    let values = Self::candidates(props, extra);
    let mut idx = vec![0usize; vars.len()];
    loop {
      let env: BTreeMap<String, W256> = vars.iter().cloned().zip(idx.iter().map(|i| values[*i])).collect();
      if props.iter().all(|p| eval_prop(&subst_prop(p, &env)) == Some(true)) {
        return Some(env);
      }
      // next assignment, odometer style
      let mut k = 0;
      loop {
        if k == idx.len() {
          return None;
        }
        idx[k] += 1;
        if idx[k] < values.len() {
          break;
        }
        idx[k] = 0;
        k += 1;
      }
    }
  }
}

impl Solver for Enumerator {
  fn check_sat(&self, props: &[Prop]) -> Result<CheckSatResult, SolverError> {
    Ok(match Self::model(props, None) {
      Some(_) => CheckSatResult::Sat,
      None => CheckSatResult::Unsat,
    })
  }

  fn get_value(&self, props: &[Prop], expr: &Expr) -> Result<Option<W256>, SolverError> {
    let Some(env) = Self::model(props, Some(expr)) else {
      return Ok(None);
    };
    match simplify(&subst(expr, &env)) {
      Expr::Lit(w) => Ok(Some(w)),
      _ => Err(SolverError::Inconclusive),
    }
  }
}
