use std::collections::BTreeSet;
use std::sync::Arc;

use crate::modules::types::{Cell, Expr, Prop, W256};

fn lit_bool(b: bool) -> Expr {
  if b {
    Expr::Lit(W256::ONE)
  } else {
    Expr::Lit(W256::ZERO)
  }
}

fn shift_amount(e: &Expr) -> Option<usize> {
  match e {
    Expr::Lit(w) => Some(w.to_usize().unwrap_or(usize::MAX).min(256)),
    _ => None,
  }
}

/// Constant folding plus the handful of rewrites needed to keep call-data words readable
/// after they have been split into bytes and reassembled.
pub fn simplify(expr: &Expr) -> Expr {
  match expr {
    Expr::Lit(_) | Expr::Var(_) | Expr::ConcreteStore(_) => expr.clone(),
    Expr::Add(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x + y),
      (Expr::Lit(z), e) | (e, Expr::Lit(z)) if z.is_zero() => e,
      (x, y) => Expr::Add(Box::new(x), Box::new(y)),
    },
    Expr::Sub(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x - y),
      (e, Expr::Lit(z)) if z.is_zero() => e,
      (x, y) if x == y => Expr::Lit(W256::ZERO),
      (x, y) => Expr::Sub(Box::new(x), Box::new(y)),
    },
    Expr::Mul(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x.mul(&y)),
      (Expr::Lit(z), _) | (_, Expr::Lit(z)) if z.is_zero() => Expr::Lit(W256::ZERO),
      (Expr::Lit(o), e) | (e, Expr::Lit(o)) if o == W256::ONE => e,
      (x, y) => Expr::Mul(Box::new(x), Box::new(y)),
    },
    Expr::Div(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x.div(&y)),
      (_, Expr::Lit(z)) if z.is_zero() => Expr::Lit(W256::ZERO),
      (e, Expr::Lit(o)) if o == W256::ONE => e,
      (x, y) => Expr::Div(Box::new(x), Box::new(y)),
    },
    Expr::Mod(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x.rem(&y)),
      (_, Expr::Lit(z)) if z.is_zero() => Expr::Lit(W256::ZERO),
      (x, y) => Expr::Mod(Box::new(x), Box::new(y)),
    },
    Expr::LT(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => lit_bool(x < y),
      (_, Expr::Lit(z)) if z.is_zero() => lit_bool(false),
      (x, y) if x == y => lit_bool(false),
      (x, y) => Expr::LT(Box::new(x), Box::new(y)),
    },
    Expr::GT(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => lit_bool(x > y),
      (Expr::Lit(z), _) if z.is_zero() => lit_bool(false),
      (x, y) if x == y => lit_bool(false),
      (x, y) => Expr::GT(Box::new(x), Box::new(y)),
    },
    Expr::Eq(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => lit_bool(x == y),
      (x, y) if x == y => lit_bool(true),
      (x, y) => Expr::Eq(Box::new(x), Box::new(y)),
    },
    Expr::IsZero(a) => match simplify(a) {
      Expr::Lit(x) => lit_bool(x.is_zero()),
      e => Expr::IsZero(Box::new(e)),
    },
    Expr::And(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x & y),
      (Expr::Lit(z), _) | (_, Expr::Lit(z)) if z.is_zero() => Expr::Lit(W256::ZERO),
      (Expr::Lit(m), e) | (e, Expr::Lit(m)) if m == W256::MAX => e,
      (x, y) => Expr::And(Box::new(x), Box::new(y)),
    },
    Expr::Or(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x | y),
      (Expr::Lit(z), e) | (e, Expr::Lit(z)) if z.is_zero() => e,
      (x, y) if x == y => x,
      (x, y) => Expr::Or(Box::new(x), Box::new(y)),
    },
    Expr::Xor(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Expr::Lit(x ^ y),
      (Expr::Lit(z), e) | (e, Expr::Lit(z)) if z.is_zero() => e,
      (x, y) if x == y => Expr::Lit(W256::ZERO),
      (x, y) => Expr::Xor(Box::new(x), Box::new(y)),
    },
    Expr::Not(a) => match simplify(a) {
      Expr::Lit(x) => Expr::Lit(!x),
      Expr::Not(inner) => *inner,
      e => Expr::Not(Box::new(e)),
    },
    Expr::SHL(s, v) => shl(simplify(s), simplify(v)),
    Expr::SHR(s, v) => shr(simplify(s), simplify(v)),
    Expr::ITE(c, t, e) => match simplify(c) {
      Expr::Lit(x) => {
        if x.is_zero() {
          simplify(e)
        } else {
          simplify(t)
        }
      }
      cond => {
        let (t, e) = (simplify(t), simplify(e));
        if t == e {
          t
        } else {
          Expr::ITE(Box::new(cond), Box::new(t), Box::new(e))
        }
      }
    },
    Expr::SStore(k, v, prev) => Expr::SStore(Box::new(simplify(k)), Box::new(simplify(v)), Box::new(simplify(prev))),
    Expr::SLoad(k, store) => {
      let store = simplify(store);
      match read_storage(&simplify(k), &store) {
        Expr::SLoad(k, s) => Expr::SLoad(k, s),
        resolved => simplify(&resolved),
      }
    }
  }
}

fn shl(s: Expr, v: Expr) -> Expr {
  match (shift_amount(&s), v) {
    (Some(n), _) if n >= 256 => Expr::Lit(W256::ZERO),
    (Some(0), v) => v,
    (Some(_), Expr::Lit(x)) => Expr::Lit(x.shl(&s.as_lit().unwrap_or_default())),
    (Some(n), Expr::SHL(inner_s, inner_v)) if shift_amount(&inner_s).is_some() => {
      let m = shift_amount(&inner_s).unwrap_or(256);
      shl(Expr::lit((n + m) as u64), *inner_v)
    }
    (Some(_), Expr::Or(a, b)) => simplify(&Expr::Or(
      Box::new(shl(s.clone(), *a)),
      Box::new(shl(s, *b)),
    )),
    (_, v) => Expr::SHL(Box::new(s), Box::new(v)),
  }
}

fn shr(s: Expr, v: Expr) -> Expr {
  match (shift_amount(&s), v) {
    (Some(n), _) if n >= 256 => Expr::Lit(W256::ZERO),
    (Some(0), v) => v,
    (Some(_), Expr::Lit(x)) => Expr::Lit(x.shr(&s.as_lit().unwrap_or_default())),
    (Some(n), Expr::SHR(inner_s, inner_v)) if shift_amount(&inner_s).is_some() => {
      let m = shift_amount(&inner_s).unwrap_or(256);
      shr(Expr::lit((n + m) as u64), *inner_v)
    }
    (Some(n), Expr::SHL(inner_s, inner_v)) if shift_amount(&inner_s) == Some(n) => {
      simplify(&Expr::And(Box::new(*inner_v), Box::new(Expr::Lit(W256::MAX.shr(&W256::from_u64(n as u64))))))
    }
    (Some(_), Expr::Or(a, b)) => simplify(&Expr::Or(
      Box::new(shr(s.clone(), *a)),
      Box::new(shr(s, *b)),
    )),
    (_, v) => Expr::SHR(Box::new(s), Box::new(v)),
  }
}

pub fn simplify_prop(prop: &Prop) -> Prop {
  match prop {
    Prop::PBool(_) => prop.clone(),
    Prop::PEq(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Prop::PBool(x == y),
      (x, y) if x == y => Prop::PBool(true),
      (x, y) => Prop::PEq(x, y),
    },
    Prop::PLT(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Prop::PBool(x < y),
      (x, y) if x == y => Prop::PBool(false),
      (x, y) => Prop::PLT(x, y),
    },
    Prop::PGT(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Prop::PBool(x > y),
      (x, y) if x == y => Prop::PBool(false),
      (x, y) => Prop::PGT(x, y),
    },
    Prop::PLEq(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Prop::PBool(x <= y),
      (x, y) if x == y => Prop::PBool(true),
      (x, y) => Prop::PLEq(x, y),
    },
    Prop::PGEq(a, b) => match (simplify(a), simplify(b)) {
      (Expr::Lit(x), Expr::Lit(y)) => Prop::PBool(x >= y),
      (x, y) if x == y => Prop::PBool(true),
      (x, y) => Prop::PGEq(x, y),
    },
    Prop::PNeg(p) => match simplify_prop(p) {
      Prop::PBool(b) => Prop::PBool(!b),
      Prop::PNeg(inner) => *inner,
      p => Prop::PNeg(Box::new(p)),
    },
    Prop::PAnd(a, b) => match (simplify_prop(a), simplify_prop(b)) {
      (Prop::PBool(false), _) | (_, Prop::PBool(false)) => Prop::PBool(false),
      (Prop::PBool(true), p) | (p, Prop::PBool(true)) => p,
      (x, y) => Prop::PAnd(Box::new(x), Box::new(y)),
    },
    Prop::POr(a, b) => match (simplify_prop(a), simplify_prop(b)) {
      (Prop::PBool(true), _) | (_, Prop::PBool(true)) => Prop::PBool(true),
      (Prop::PBool(false), p) | (p, Prop::PBool(false)) => p,
      (x, y) => Prop::POr(Box::new(x), Box::new(y)),
    },
    Prop::PImpl(a, b) => match (simplify_prop(a), simplify_prop(b)) {
      (Prop::PBool(false), _) | (_, Prop::PBool(true)) => Prop::PBool(true),
      (Prop::PBool(true), p) => p,
      (x, Prop::PBool(false)) => simplify_prop(&Prop::PNeg(Box::new(x))),
      (x, y) => Prop::PImpl(Box::new(x), Box::new(y)),
    },
  }
}

/// `Some(b)` when the proposition folds to a constant without consulting a solver.
pub fn eval_prop(prop: &Prop) -> Option<bool> {
  match simplify_prop(prop) {
    Prop::PBool(b) => Some(b),
    _ => None,
  }
}

// Storage ----------------------------------------------------------------------------------------

/// Resolves a read against a chain of writes into an if-then-else over the written keys.
pub fn read_storage(key: &Expr, store: &Expr) -> Expr {
  match store {
    Expr::ConcreteStore(map) => match key {
      Expr::Lit(k) => Expr::Lit(map.get(k).copied().unwrap_or(W256::ZERO)),
      _ => map.iter().rev().fold(Expr::Lit(W256::ZERO), |rest, (k, v)| {
        Expr::ITE(
          Box::new(Expr::Eq(Box::new(key.clone()), Box::new(Expr::Lit(*k)))),
          Box::new(Expr::Lit(*v)),
          Box::new(rest),
        )
      }),
    },
    Expr::SStore(k, v, prev) => match (key, k.as_ref()) {
      (Expr::Lit(a), Expr::Lit(b)) if a != b => read_storage(key, prev),
      (a, b) if a == b => *v.clone(),
      _ => Expr::ITE(
        Box::new(Expr::Eq(Box::new(key.clone()), k.clone())),
        v.clone(),
        Box::new(read_storage(key, prev)),
      ),
    },
    _ => Expr::SLoad(Box::new(key.clone()), Box::new(store.clone())),
  }
}

pub fn write_storage(key: &Expr, val: &Expr, store: &Expr) -> Expr {
  match (key, val, store) {
    (Expr::Lit(k), Expr::Lit(v), Expr::ConcreteStore(map)) => {
      let mut map = map.clone();
      map.insert(*k, *v);
      Expr::ConcreteStore(map)
    }
    _ => Expr::SStore(Box::new(key.clone()), Box::new(val.clone()), Box::new(store.clone())),
  }
}

// Buffers ----------------------------------------------------------------------------------------

fn same_word(a: &Arc<Expr>, b: &Arc<Expr>) -> bool {
  Arc::ptr_eq(a, b) || a == b
}

/// Reads the 32-byte big-endian word starting at `offset`; bytes past the end read as zero.
pub fn read_word(buf: &[Cell], offset: usize) -> Expr {
  let cells: Vec<Cell> =
    (0..32).map(|i| offset.checked_add(i).and_then(|j| buf.get(j)).cloned().unwrap_or(Cell::Byte(0))).collect();

  let mut bytes = [0u8; 32];
  let mut pieces: Vec<Expr> = vec![];
  let mut i = 0;
  while i < 32 {
    match &cells[i] {
      Cell::Byte(b) => {
        bytes[i] = *b;
        i += 1;
      }
      Cell::Sym(word, start) => {
        let mut n = 1;
        while i + n < 32 {
          match &cells[i + n] {
            Cell::Sym(w, idx) if same_word(w, word) && *idx as usize == *start as usize + n => n += 1,
            _ => break,
          }
        }
        // bytes start..start+n of `word` placed at positions i..i+n
        let piece = Expr::SHL(
          Box::new(Expr::lit((8 * (32 - i - n)) as u64)),
          Box::new(Expr::SHR(
            Box::new(Expr::lit((8 * (32 - n)) as u64)),
            Box::new(Expr::SHL(Box::new(Expr::lit(8 * *start as u64)), Box::new((**word).clone()))),
          )),
        );
        pieces.push(piece);
        i += n;
      }
    }
  }

  let word = pieces
    .into_iter()
    .fold(Expr::Lit(W256::from_bytes(bytes.to_vec())), |acc, p| Expr::Or(Box::new(acc), Box::new(p)));
  simplify(&word)
}

// Traversal --------------------------------------------------------------------------------------

pub fn referenced_vars(props: &[Prop]) -> BTreeSet<String> {
  let mut acc = BTreeSet::new();
  for p in props {
    prop_vars(p, &mut acc);
  }
  acc
}

fn prop_vars(prop: &Prop, acc: &mut BTreeSet<String>) {
  match prop {
    Prop::PEq(a, b) | Prop::PLT(a, b) | Prop::PGT(a, b) | Prop::PGEq(a, b) | Prop::PLEq(a, b) => {
      expr_vars(a, acc);
      expr_vars(b, acc);
    }
    Prop::PNeg(p) => prop_vars(p, acc),
    Prop::PAnd(a, b) | Prop::POr(a, b) | Prop::PImpl(a, b) => {
      prop_vars(a, acc);
      prop_vars(b, acc);
    }
    Prop::PBool(_) => {}
  }
}

pub fn expr_vars(expr: &Expr, acc: &mut BTreeSet<String>) {
  match expr {
    Expr::Var(name) => {
      acc.insert(name.clone());
    }
    Expr::Lit(_) | Expr::ConcreteStore(_) => {}
    Expr::IsZero(a) | Expr::Not(a) => expr_vars(a, acc),
    Expr::Add(a, b)
    | Expr::Sub(a, b)
    | Expr::Mul(a, b)
    | Expr::Div(a, b)
    | Expr::Mod(a, b)
    | Expr::LT(a, b)
    | Expr::GT(a, b)
    | Expr::Eq(a, b)
    | Expr::And(a, b)
    | Expr::Or(a, b)
    | Expr::Xor(a, b)
    | Expr::SHL(a, b)
    | Expr::SHR(a, b)
    | Expr::SLoad(a, b) => {
      expr_vars(a, acc);
      expr_vars(b, acc);
    }
    Expr::ITE(a, b, c) | Expr::SStore(a, b, c) => {
      expr_vars(a, acc);
      expr_vars(b, acc);
      expr_vars(c, acc);
    }
  }
}
