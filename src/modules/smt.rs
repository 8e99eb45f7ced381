use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::modules::expr::{expr_vars, referenced_vars};
use crate::modules::types::{Expr, Prop, W256};

/// Name bound to the expression whose value is requested with `get-value`.
pub const VALUE_SYMBOL: &str = "rhoguard_value";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SMT2(pub Vec<String>);

impl SMT2 {
  pub fn push(&mut self, line: String) {
    self.0.push(line);
  }
}

impl fmt::Display for SMT2 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join("\n"))
  }
}

fn zero() -> String {
  "(_ bv0 256)".to_string()
}

fn one() -> String {
  "(_ bv1 256)".to_string()
}

fn op1(op: &str, a: &Expr) -> String {
  format!("({} {})", op, expr_to_smt(a))
}

fn op2(op: &str, a: &Expr, b: &Expr) -> String {
  format!("({} {} {})", op, expr_to_smt(a), expr_to_smt(b))
}

fn op2_check_zero(op: &str, a: &Expr, b: &Expr) -> String {
  let benc = expr_to_smt(b);
  format!("(ite (= {} {}) {} ({} {} {}))", benc, zero(), zero(), op, expr_to_smt(a), benc)
}

fn as_word(cond: String) -> String {
  format!("(ite {} {} {})", cond, one(), zero())
}

fn lit(w: &W256) -> String {
  format!("(_ bv{} 256)", w.to_decimal())
}

pub fn expr_to_smt(expr: &Expr) -> String {
  match expr {
    Expr::Lit(w) => lit(w),
    Expr::Var(s) => s.clone(),
    Expr::Add(a, b) => op2("bvadd", a, b),
    Expr::Sub(a, b) => op2("bvsub", a, b),
    Expr::Mul(a, b) => op2("bvmul", a, b),
    Expr::Div(a, b) => op2_check_zero("bvudiv", a, b),
    Expr::Mod(a, b) => op2_check_zero("bvurem", a, b),
    Expr::LT(a, b) => as_word(op2("bvult", a, b)),
    Expr::GT(a, b) => as_word(op2("bvugt", a, b)),
    Expr::Eq(a, b) => as_word(op2("=", a, b)),
    Expr::IsZero(a) => as_word(format!("(= {} {})", expr_to_smt(a), zero())),
    Expr::And(a, b) => op2("bvand", a, b),
    Expr::Or(a, b) => op2("bvor", a, b),
    Expr::Xor(a, b) => op2("bvxor", a, b),
    Expr::Not(a) => op1("bvnot", a),
    Expr::SHL(a, b) => op2("bvshl", b, a),
    Expr::SHR(a, b) => op2("bvlshr", b, a),
    Expr::ITE(c, t, e) => {
      format!("(ite (= {} {}) {} {})", expr_to_smt(c), zero(), expr_to_smt(e), expr_to_smt(t))
    }
    Expr::ConcreteStore(store) => {
      let empty = format!("((as const (Array (_ BitVec 256) (_ BitVec 256))) {})", zero());
      store.iter().fold(empty, |acc, (k, v)| format!("(store {} {} {})", acc, lit(k), lit(v)))
    }
    Expr::SStore(k, v, prev) => {
      format!("(store {} {} {})", expr_to_smt(prev), expr_to_smt(k), expr_to_smt(v))
    }
    Expr::SLoad(k, store) => op2("select", store, k),
  }
}

pub fn prop_to_smt(prop: &Prop) -> String {
  match prop {
    Prop::PEq(a, b) => op2("=", a, b),
    Prop::PLT(a, b) => op2("bvult", a, b),
    Prop::PGT(a, b) => op2("bvugt", a, b),
    Prop::PLEq(a, b) => op2("bvule", a, b),
    Prop::PGEq(a, b) => op2("bvuge", a, b),
    Prop::PNeg(a) => format!("(not {})", prop_to_smt(a)),
    Prop::PAnd(a, b) => format!("(and {} {})", prop_to_smt(a), prop_to_smt(b)),
    Prop::POr(a, b) => format!("(or {} {})", prop_to_smt(a), prop_to_smt(b)),
    Prop::PImpl(a, b) => format!("(=> {} {})", prop_to_smt(a), prop_to_smt(b)),
    Prop::PBool(b) => b.to_string(),
  }
}

fn declare_vars(names: impl IntoIterator<Item = String>) -> Vec<String> {
  names.into_iter().map(|n| format!("(declare-const {} (_ BitVec 256))", n)).collect()
}

/// Declarations and assertions for a conjunction of propositions, without `check-sat`.
pub fn assert_props(props: &[Prop]) -> SMT2 {
  let mut smt = SMT2::default();
  smt.push("(set-logic QF_ABV)".to_string());
  for decl in declare_vars(referenced_vars(props)) {
    smt.push(decl);
  }
  for p in props {
    smt.push(format!("(assert {})", prop_to_smt(p)));
  }
  smt
}

/// Like `assert_props`, but also binds `expr` to `VALUE_SYMBOL` and asks for its value.
pub fn value_query(props: &[Prop], expr: &Expr) -> SMT2 {
  let mut vars = referenced_vars(props);
  expr_vars(expr, &mut vars);
  let mut smt = SMT2::default();
  smt.push("(set-logic QF_ABV)".to_string());
  for decl in declare_vars(vars) {
    smt.push(decl);
  }
  smt.push(format!("(declare-const {} (_ BitVec 256))", VALUE_SYMBOL));
  for p in props {
    smt.push(format!("(assert {})", prop_to_smt(p)));
  }
  smt.push(format!("(assert (= {} {}))", VALUE_SYMBOL, expr_to_smt(expr)));
  smt.push("(check-sat)".to_string());
  smt.push(format!("(get-value ({}))", VALUE_SYMBOL));
  smt
}

fn value_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(&format!(r"\(\(\s*{}\s+(?:#x([0-9a-fA-F]+)|#b([01]+)|\(_ bv([0-9]+) [0-9]+\))\s*\)\)", VALUE_SYMBOL))
      .expect("static regex")
  })
}

/// Parses z3's answer to `(get-value (VALUE_SYMBOL))`.
pub fn parse_z3_value(output: &str) -> Option<W256> {
  let caps = value_regex().captures(output)?;
  if let Some(h) = caps.get(1) {
    return format!("0x{}", h.as_str().trim_start_matches('0')).parse().ok();
  }
  if let Some(b) = caps.get(2) {
    let n = num_bigint::BigUint::parse_bytes(b.as_str().as_bytes(), 2)?;
    return Some(W256::from_biguint(&n));
  }
  caps.get(3)?.as_str().parse().ok()
}
