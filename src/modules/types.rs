use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// Words -------------------------------------------------------------------------------------------

/// 256-bit unsigned word stored as `(low, high)` halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct W256(pub u128, pub u128);

pub type Addr = W256;

#[derive(Debug, Error)]
#[error("invalid 256-bit word: {0}")]
pub struct ParseWordError(pub String);

impl W256 {
  pub const ZERO: W256 = W256(0, 0);
  pub const ONE: W256 = W256(1, 0);
  pub const MAX: W256 = W256(u128::MAX, u128::MAX);

  pub fn from_u64(n: u64) -> Self {
    W256(n as u128, 0)
  }

  pub fn is_zero(&self) -> bool {
    self.0 == 0 && self.1 == 0
  }

  pub fn to_usize(&self) -> Option<usize> {
    if self.1 != 0 {
      return None;
    }
    usize::try_from(self.0).ok()
  }

  /// Big-endian bytes; shorter inputs are left-padded, longer ones keep their low 32 bytes.
  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    let start = bytes.len().saturating_sub(32);
    let mut buf = [0u8; 32];
    let tail = &bytes[start..];
    buf[32 - tail.len()..].copy_from_slice(tail);
    let mut high = [0u8; 16];
    let mut low = [0u8; 16];
    high.copy_from_slice(&buf[..16]);
    low.copy_from_slice(&buf[16..]);
    W256(u128::from_be_bytes(low), u128::from_be_bytes(high))
  }

  pub fn to_be_bytes(&self) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&self.1.to_be_bytes());
    out[16..].copy_from_slice(&self.0.to_be_bytes());
    out
  }

  /// Byte `i` counted from the most significant end, as EVM `BYTE` does.
  pub fn byte(&self, i: usize) -> u8 {
    if i >= 32 {
      0
    } else {
      self.to_be_bytes()[i]
    }
  }

  pub fn to_hex(&self) -> String {
    if self.1 == 0 {
      format!("{:x}", self.0)
    } else {
      format!("{:x}{:032x}", self.1, self.0)
    }
  }

  pub fn to_decimal(&self) -> String {
    self.to_biguint().to_str_radix(10)
  }

  pub fn to_biguint(&self) -> BigUint {
    BigUint::from_bytes_be(&self.to_be_bytes())
  }

  /// Reduces modulo 2^256.
  pub fn from_biguint(n: &BigUint) -> Self {
    W256::from_bytes(n.to_bytes_be())
  }

  pub fn mul(&self, rhs: &W256) -> W256 {
    W256::from_biguint(&(self.to_biguint() * rhs.to_biguint()))
  }

  pub fn div(&self, rhs: &W256) -> W256 {
    if rhs.is_zero() {
      return W256::ZERO;
    }
    W256::from_biguint(&(self.to_biguint() / rhs.to_biguint()))
  }

  pub fn rem(&self, rhs: &W256) -> W256 {
    if rhs.is_zero() {
      return W256::ZERO;
    }
    W256::from_biguint(&(self.to_biguint() % rhs.to_biguint()))
  }

  pub fn shl(&self, shift: &W256) -> W256 {
    match shift.to_usize() {
      Some(n) if n < 256 => {
        if n == 0 {
          *self
        } else if n < 128 {
          W256(self.0 << n, (self.1 << n) | (self.0 >> (128 - n)))
        } else {
          W256(0, self.0 << (n - 128))
        }
      }
      _ => W256::ZERO,
    }
  }

  pub fn shr(&self, shift: &W256) -> W256 {
    match shift.to_usize() {
      Some(n) if n < 256 => {
        if n == 0 {
          *self
        } else if n < 128 {
          W256((self.0 >> n) | (self.1 << (128 - n)), self.1 >> n)
        } else {
          W256(self.1 >> (n - 128), 0)
        }
      }
      _ => W256::ZERO,
    }
  }
}

impl Ord for W256 {
  fn cmp(&self, other: &Self) -> Ordering {
    self.1.cmp(&other.1).then(self.0.cmp(&other.0))
  }
}

impl PartialOrd for W256 {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl ops::Add for W256 {
  type Output = W256;

  fn add(self, rhs: Self) -> Self::Output {
    let (low, carry) = self.0.overflowing_add(rhs.0);
    W256(low, self.1.wrapping_add(rhs.1).wrapping_add(carry as u128))
  }
}

impl ops::Sub for W256 {
  type Output = W256;

  fn sub(self, rhs: Self) -> Self::Output {
    let (low, borrow) = self.0.overflowing_sub(rhs.0);
    W256(low, self.1.wrapping_sub(rhs.1).wrapping_sub(borrow as u128))
  }
}

impl ops::BitAnd for W256 {
  type Output = W256;

  fn bitand(self, rhs: Self) -> Self::Output {
    W256(self.0 & rhs.0, self.1 & rhs.1)
  }
}

impl ops::BitOr for W256 {
  type Output = W256;

  fn bitor(self, rhs: Self) -> Self::Output {
    W256(self.0 | rhs.0, self.1 | rhs.1)
  }
}

impl ops::BitXor for W256 {
  type Output = W256;

  fn bitxor(self, rhs: Self) -> Self::Output {
    W256(self.0 ^ rhs.0, self.1 ^ rhs.1)
  }
}

impl ops::Not for W256 {
  type Output = W256;

  fn not(self) -> Self::Output {
    W256(!self.0, !self.1)
  }
}

impl fmt::Display for W256 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{}", self.to_hex())
  }
}

impl From<u64> for W256 {
  fn from(n: u64) -> Self {
    W256::from_u64(n)
  }
}

/// Accepts `0x`-prefixed hex or plain decimal.
impl FromStr for W256 {
  type Err = ParseWordError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
      Some(digits) if digits.is_empty() => Some(BigUint::zero()),
      Some(digits) if digits.len() <= 64 => BigUint::parse_bytes(digits.as_bytes(), 16),
      Some(_) => None,
      None => BigUint::parse_bytes(s.as_bytes(), 10),
    };
    match parsed {
      Some(n) if n.bits() <= 256 => Ok(W256::from_biguint(&n)),
      _ => Err(ParseWordError(s.to_string())),
    }
  }
}

impl Serialize for W256 {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WordRepr {
  Num(u64),
  Text(String),
}

impl<'de> Deserialize<'de> for W256 {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    match WordRepr::deserialize(deserializer)? {
      WordRepr::Num(n) => Ok(W256::from_u64(n)),
      WordRepr::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
  }
}

// Symbolic IR -------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
  Lit(W256),
  Var(String),

  // Integers
  Add(Box<Expr>, Box<Expr>),
  Sub(Box<Expr>, Box<Expr>),
  Mul(Box<Expr>, Box<Expr>),
  Div(Box<Expr>, Box<Expr>),
  Mod(Box<Expr>, Box<Expr>),

  // Booleans, 1 for true and 0 for false
  LT(Box<Expr>, Box<Expr>),
  GT(Box<Expr>, Box<Expr>),
  Eq(Box<Expr>, Box<Expr>),
  IsZero(Box<Expr>),

  // Bits; shifts take (shift, value)
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
  Xor(Box<Expr>, Box<Expr>),
  Not(Box<Expr>),
  SHL(Box<Expr>, Box<Expr>),
  SHR(Box<Expr>, Box<Expr>),

  // Control Flow
  ITE(Box<Expr>, Box<Expr>, Box<Expr>),

  // Storage
  ConcreteStore(BTreeMap<W256, W256>),
  SStore(Box<Expr>, Box<Expr>, Box<Expr>),
  SLoad(Box<Expr>, Box<Expr>),
}

impl Expr {
  pub fn lit(n: u64) -> Expr {
    Expr::Lit(W256::from_u64(n))
  }

  pub fn var(name: &str) -> Expr {
    Expr::Var(name.to_string())
  }

  pub fn as_lit(&self) -> Option<W256> {
    match self {
      Expr::Lit(w) => Some(*w),
      _ => None,
    }
  }

  pub fn empty_store() -> Expr {
    Expr::ConcreteStore(BTreeMap::new())
  }
}

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Expr::Lit(val) => write!(f, "Lit({})", val),
      Expr::Var(name) => write!(f, "Var({})", name),
      Expr::Add(a, b) => write!(f, "Add({}, {})", a, b),
      Expr::Sub(a, b) => write!(f, "Sub({}, {})", a, b),
      Expr::Mul(a, b) => write!(f, "Mul({}, {})", a, b),
      Expr::Div(a, b) => write!(f, "Div({}, {})", a, b),
      Expr::Mod(a, b) => write!(f, "Mod({}, {})", a, b),
      Expr::LT(a, b) => write!(f, "LT({}, {})", a, b),
      Expr::GT(a, b) => write!(f, "GT({}, {})", a, b),
      Expr::Eq(a, b) => write!(f, "Eq({}, {})", a, b),
      Expr::IsZero(a) => write!(f, "IsZero({})", a),
      Expr::And(a, b) => write!(f, "And({}, {})", a, b),
      Expr::Or(a, b) => write!(f, "Or({}, {})", a, b),
      Expr::Xor(a, b) => write!(f, "Xor({}, {})", a, b),
      Expr::Not(a) => write!(f, "Not({})", a),
      Expr::SHL(a, b) => write!(f, "SHL({}, {})", a, b),
      Expr::SHR(a, b) => write!(f, "SHR({}, {})", a, b),
      Expr::ITE(c, t, e) => write!(f, "ITE({}, {}, {})", c, t, e),
      Expr::ConcreteStore(store) => {
        let entries: Vec<String> = store.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "ConcreteStore({{{}}})", entries.join(", "))
      }
      Expr::SStore(key, val, prev) => write!(f, "SStore({}, {}, {})", key, val, prev),
      Expr::SLoad(key, store) => write!(f, "SLoad({}, {})", key, store),
    }
  }
}

// Propositions -----------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Prop {
  PEq(Expr, Expr),
  PLT(Expr, Expr),
  PGT(Expr, Expr),
  PGEq(Expr, Expr),
  PLEq(Expr, Expr),
  PNeg(Box<Prop>),
  PAnd(Box<Prop>, Box<Prop>),
  POr(Box<Prop>, Box<Prop>),
  PImpl(Box<Prop>, Box<Prop>),
  PBool(bool),
}

impl fmt::Display for Prop {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Prop::PEq(a, b) => write!(f, "({} == {})", a, b),
      Prop::PLT(a, b) => write!(f, "({} < {})", a, b),
      Prop::PGT(a, b) => write!(f, "({} > {})", a, b),
      Prop::PGEq(a, b) => write!(f, "({} >= {})", a, b),
      Prop::PLEq(a, b) => write!(f, "({} <= {})", a, b),
      Prop::PNeg(p) => write!(f, "!{}", p),
      Prop::PAnd(a, b) => write!(f, "({} && {})", a, b),
      Prop::POr(a, b) => write!(f, "({} || {})", a, b),
      Prop::PImpl(a, b) => write!(f, "({} => {})", a, b),
      Prop::PBool(b) => write!(f, "{}", b),
    }
  }
}

// Buffers ----------------------------------------------------------------------------------------

/// One byte of memory, call data or return data: either concrete or byte `i` (big-endian) of a
/// symbolic word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
  Byte(u8),
  Sym(Arc<Expr>, u8),
}

pub type Buf = Vec<Cell>;

pub fn concrete_buf(bytes: &[u8]) -> Buf {
  bytes.iter().map(|b| Cell::Byte(*b)).collect()
}

/// Expands a word into 32 cells.
pub fn word_cells(word: &Expr) -> Buf {
  match word {
    Expr::Lit(w) => concrete_buf(&w.to_be_bytes()),
    e => {
      let shared = Arc::new(e.clone());
      (0..32).map(|i| Cell::Sym(shared.clone(), i)).collect()
    }
  }
}

pub fn concrete_bytes(buf: &[Cell]) -> Option<Vec<u8>> {
  buf
    .iter()
    .map(|c| match c {
      Cell::Byte(b) => Some(*b),
      Cell::Sym(..) => None,
    })
    .collect()
}

// States -----------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub usize);

impl fmt::Display for StateId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// The call frame whose code is currently being decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
  pub is_create: bool,
  pub code_address: Addr,
  pub caller: Addr,
  pub depth: usize,
}

// Errors -----------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvmError {
  #[error("stack underrun")]
  StackUnderrun,
  #[error("stack limit exceeded")]
  StackLimitExceeded,
  #[error("bad jump destination {0}")]
  BadJumpDestination(W256),
  #[error("revert")]
  Revert,
  #[error("unrecognized opcode 0x{0:02x}")]
  UnrecognizedOpcode(u8),
  #[error("state change while static")]
  StateChangeWhileStatic,
  #[error("call depth limit reached")]
  CallDepthLimitReached,
  #[error("invalid memory access")]
  InvalidMemoryAccess,
  #[error("creation returned symbolic code")]
  InvalidFormat,
  #[error("unexpected symbolic argument at pc {pc}: {msg}")]
  UnexpectedSymbolicArg { pc: usize, msg: String },
  #[error("no branch of the condition at pc {0} is feasible")]
  InfeasiblePath(usize),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_w256_format() {
    let x = W256(12, 3);
    assert_eq!("30000000000000000000000000000000c", x.to_hex());
    assert_eq!("1020847100762815390390123822295304634380", x.to_decimal());
    assert_eq!("0x2a", W256::from_u64(42).to_string());
  }

  #[test]
  fn test_w256_from_bytes() {
    assert_eq!(W256::from_bytes(vec![1, 2, 3]), W256(0x010203, 0));
    let input = vec![1; 32];
    let half = u128::from_be_bytes([1; 16]);
    assert_eq!(W256::from_bytes(input.clone()), W256(half, half));
    assert_eq!(W256::from_bytes(input).to_be_bytes(), [1; 32]);
  }

  #[test]
  fn test_w256_wrapping_arith() {
    assert_eq!(W256::MAX + W256::ONE, W256::ZERO);
    assert_eq!(W256::ZERO - W256::ONE, W256::MAX);
    assert_eq!(W256(u128::MAX, 0) + W256::ONE, W256(0, 1));
    assert_eq!(W256::from_u64(6).mul(&W256::from_u64(7)), W256::from_u64(42));
    assert_eq!(W256::from_u64(7).div(&W256::ZERO), W256::ZERO);
    assert_eq!(W256::from_u64(7).rem(&W256::from_u64(4)), W256::from_u64(3));
  }

  #[test]
  fn test_w256_shifts_and_order() {
    let one = W256::ONE;
    assert_eq!(one.shl(&W256::from_u64(128)), W256(0, 1));
    assert_eq!(one.shl(&W256::from_u64(255)).shr(&W256::from_u64(255)), one);
    assert_eq!(one.shl(&W256::from_u64(256)), W256::ZERO);
    assert_eq!(W256(0, 1).shr(&W256::from_u64(1)), W256(1 << 127, 0));
    assert!(W256(0, 1) > W256(u128::MAX, 0));
    assert_eq!(W256::from_u64(0xab).byte(31), 0xab);
  }

  #[test]
  fn test_w256_parse() {
    assert_eq!("0x2000".parse::<W256>().unwrap(), W256::from_u64(0x2000));
    assert_eq!("42".parse::<W256>().unwrap(), W256::from_u64(42));
    assert!("0xzz".parse::<W256>().is_err());
    let parsed: W256 = serde_json::from_str("\"0x10\"").unwrap();
    assert_eq!(parsed, W256::from_u64(16));
    let parsed: W256 = serde_json::from_str("7").unwrap();
    assert_eq!(parsed, W256::from_u64(7));
  }
}
