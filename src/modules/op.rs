use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Stop,
  Add,
  Mul,
  Sub,
  Div,
  Mod,
  Lt,
  Gt,
  Eq,
  Iszero,
  And,
  Or,
  Xor,
  Not,
  Shl,
  Shr,
  Address,
  Caller,
  Callvalue,
  Calldataload,
  Calldatasize,
  Codecopy,
  Pop,
  Mload,
  Mstore,
  Sload,
  Sstore,
  Jump,
  Jumpi,
  Pc,
  Gas,
  Jumpdest,
  Push0,
  Push(u8),
  Dup(u8),
  Swap(u8),
  Call,
  Staticcall,
  Return,
  Revert,
  Invalid,
  Unknown(u8),
}

const FIXED: &[(u8, Op, &str)] = &[
  (0x00, Op::Stop, "STOP"),
  (0x01, Op::Add, "ADD"),
  (0x02, Op::Mul, "MUL"),
  (0x03, Op::Sub, "SUB"),
  (0x04, Op::Div, "DIV"),
  (0x06, Op::Mod, "MOD"),
  (0x10, Op::Lt, "LT"),
  (0x11, Op::Gt, "GT"),
  (0x14, Op::Eq, "EQ"),
  (0x15, Op::Iszero, "ISZERO"),
  (0x16, Op::And, "AND"),
  (0x17, Op::Or, "OR"),
  (0x18, Op::Xor, "XOR"),
  (0x19, Op::Not, "NOT"),
  (0x1b, Op::Shl, "SHL"),
  (0x1c, Op::Shr, "SHR"),
  (0x30, Op::Address, "ADDRESS"),
  (0x33, Op::Caller, "CALLER"),
  (0x34, Op::Callvalue, "CALLVALUE"),
  (0x35, Op::Calldataload, "CALLDATALOAD"),
  (0x36, Op::Calldatasize, "CALLDATASIZE"),
  (0x39, Op::Codecopy, "CODECOPY"),
  (0x50, Op::Pop, "POP"),
  (0x51, Op::Mload, "MLOAD"),
  (0x52, Op::Mstore, "MSTORE"),
  (0x54, Op::Sload, "SLOAD"),
  (0x55, Op::Sstore, "SSTORE"),
  (0x56, Op::Jump, "JUMP"),
  (0x57, Op::Jumpi, "JUMPI"),
  (0x58, Op::Pc, "PC"),
  (0x5a, Op::Gas, "GAS"),
  (0x5b, Op::Jumpdest, "JUMPDEST"),
  (0x5f, Op::Push0, "PUSH0"),
  (0xf1, Op::Call, "CALL"),
  (0xf3, Op::Return, "RETURN"),
  (0xfa, Op::Staticcall, "STATICCALL"),
  (0xfd, Op::Revert, "REVERT"),
  (0xfe, Op::Invalid, "INVALID"),
];

pub fn get_op(op: u8) -> Op {
  match op {
    0x60..=0x7f => Op::Push(op - 0x5f),
    0x80..=0x8f => Op::Dup(op - 0x7f),
    0x90..=0x9f => Op::Swap(op - 0x8f),
    _ => FIXED.iter().find(|(b, _, _)| *b == op).map(|(_, o, _)| *o).unwrap_or(Op::Unknown(op)),
  }
}

/// Instruction width in bytes, immediates included.
pub fn op_size(op: u8) -> usize {
  match get_op(op) {
    Op::Push(n) => 1 + n as usize,
    _ => 1,
  }
}

/// Inverse of the mnemonic table; `PUSHn`/`DUPn`/`SWAPn` map to their numbered opcodes.
pub fn op_from_mnemonic(name: &str) -> Option<u8> {
  let upper = name.to_ascii_uppercase();
  if let Some((b, _, _)) = FIXED.iter().find(|(_, _, m)| *m == upper) {
    return Some(*b);
  }
  let numbered = |prefix: &str, base: u8, max: u8| -> Option<u8> {
    let n: u8 = upper.strip_prefix(prefix)?.parse().ok()?;
    (1..=max).contains(&n).then(|| base + n - 1)
  };
  numbered("PUSH", 0x60, 32).or_else(|| numbered("DUP", 0x80, 16)).or_else(|| numbered("SWAP", 0x90, 16))
}

impl fmt::Display for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Op::Push(n) => write!(f, "PUSH{}", n),
      Op::Dup(n) => write!(f, "DUP{}", n),
      Op::Swap(n) => write!(f, "SWAP{}", n),
      Op::Unknown(b) => write!(f, "UNKNOWN(0x{:02x})", b),
      op => match FIXED.iter().find(|(_, o, _)| o == op) {
        Some((_, _, m)) => write!(f, "{}", m),
        None => write!(f, "{:?}", op),
      },
    }
  }
}

/// Renders the instruction at `pc` with its immediate, for traces.
pub fn op_string(code: &[u8], pc: usize) -> String {
  let Some(&byte) = code.get(pc) else {
    return "STOP".to_string();
  };
  match get_op(byte) {
    Op::Push(n) => {
      let end = (pc + 1 + n as usize).min(code.len());
      let imm = code.get(pc + 1..end).unwrap_or(&[]);
      format!("PUSH{} 0x{}", n, hex::encode(imm))
    }
    op => op.to_string(),
  }
}
