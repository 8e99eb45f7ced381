use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::modules::engine::StateView;
use crate::modules::expr::{read_storage, read_word, simplify, write_storage};
use crate::modules::op::{get_op, op_size, op_string, Op};
use crate::modules::solvers::{can_be_true, Solver, SolverError};
use crate::modules::types::{
  concrete_buf, concrete_bytes, word_cells, Addr, Buf, CallContext, Cell, EvmError, Expr, Prop, StateId, W256,
};

const STACK_LIMIT: usize = 1024;
const MEMORY_LIMIT: usize = 1 << 24;
const GAS_PLACEHOLDER: u64 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
  pub code: Arc<Vec<u8>>,
  pub jumpdests: Arc<BTreeSet<usize>>,
  pub storage: Expr,
}

impl Contract {
  pub fn new(code: Vec<u8>) -> Self {
    let jumpdests = Arc::new(jumpdests(&code));
    Contract { code: Arc::new(code), jumpdests, storage: Expr::empty_store() }
  }

  pub fn has_code(&self) -> bool {
    !self.code.is_empty()
  }
}

/// Offsets of `JUMPDEST` bytes that are instructions rather than push data.
fn jumpdests(code: &[u8]) -> BTreeSet<usize> {
  let mut dests = BTreeSet::new();
  let mut pc = 0;
  while pc < code.len() {
    if get_op(code[pc]) == Op::Jumpdest {
      dests.insert(pc);
    }
    pc += op_size(code[pc]);
  }
  dests
}

/// Execution state of the running call frame.
#[derive(Debug, Clone)]
pub struct FrameState {
  pub code_address: Addr,
  pub caller: Addr,
  pub value: Expr,
  pub code: Arc<Vec<u8>>,
  pub jumpdests: Arc<BTreeSet<usize>>,
  pub pc: usize,
  pub stack: Vec<Expr>,
  pub memory: Buf,
  pub calldata: Buf,
  pub is_create: bool,
  pub is_static: bool,
}

impl FrameState {
  fn new(caller: Addr, code_address: Addr, code: &Contract, calldata: Buf, is_create: bool) -> Self {
    FrameState {
      code_address,
      caller,
      value: Expr::Lit(W256::ZERO),
      code: code.code.clone(),
      jumpdests: code.jumpdests.clone(),
      pc: 0,
      stack: vec![],
      memory: vec![],
      calldata,
      is_create,
      is_static: false,
    }
  }
}

/// Where a suspended caller resumes, and the world to restore if the callee fails.
#[derive(Debug, Clone)]
pub enum FrameContext {
  CallContext { offset: usize, size: usize, callreversion: BTreeMap<Addr, Contract> },
}

#[derive(Debug, Clone)]
pub struct Frame {
  pub state: FrameState,
  pub context: FrameContext,
}

#[derive(Debug, Clone)]
pub enum FrameResult {
  FrameReturned(Buf),
  FrameReverted(Buf),
  FrameErrored(EvmError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VMResult {
  VMSuccess(Buf),
  VMFailure(EvmError),
}

#[derive(Debug)]
enum StepError {
  Evm(EvmError),
  Solver(SolverError),
}

impl From<EvmError> for StepError {
  fn from(e: EvmError) -> Self {
    StepError::Evm(e)
  }
}

impl From<SolverError> for StepError {
  fn from(e: SolverError) -> Self {
    StepError::Solver(e)
  }
}

/// One exploration state: the world, the active call stack and the path condition.
#[derive(Debug, Clone)]
pub struct VM {
  pub id: StateId,
  pub contracts: BTreeMap<Addr, Contract>,
  pub state: FrameState,
  pub frames: Vec<Frame>,
  pub constraints: Vec<Prop>,
  pub result: Option<VMResult>,
  pub max_call_depth: usize,
  tx_reversion: BTreeMap<Addr, Contract>,
  idle: bool,
}

impl VM {
  pub fn new(id: StateId, max_call_depth: usize) -> Self {
    let empty = Contract::new(vec![]);
    VM {
      id,
      contracts: BTreeMap::new(),
      state: FrameState::new(W256::ZERO, W256::ZERO, &empty, vec![], false),
      frames: vec![],
      constraints: vec![],
      result: None,
      max_call_depth,
      tx_reversion: BTreeMap::new(),
      idle: true,
    }
  }

  pub fn is_running(&self) -> bool {
    !self.idle && self.result.is_none()
  }

  pub fn pc(&self) -> usize {
    self.state.pc
  }

  pub fn storage(&self, address: &Addr) -> Expr {
    self.contracts.get(address).map(|c| c.storage.clone()).unwrap_or_else(Expr::empty_store)
  }

  /// Starts a message call from `caller` to `to`. A call to an account without code succeeds at once.
  pub fn begin_call(&mut self, caller: Addr, to: Addr, calldata: Buf) {
    self.tx_reversion = self.contracts.clone();
    self.frames.clear();
    self.idle = false;
    match self.contracts.get(&to) {
      Some(c) if c.has_code() => {
        self.state = FrameState::new(caller, to, c, calldata, false);
        self.result = None;
      }
      _ => self.result = Some(VMResult::VMSuccess(vec![])),
    }
  }

  /// Starts a creation transaction running `init` for a fresh account at `address`.
  pub fn begin_create(&mut self, creator: Addr, address: Addr, init: Vec<u8>) {
    self.tx_reversion = self.contracts.clone();
    self.frames.clear();
    self.idle = false;
    self.contracts.insert(address, Contract::new(vec![]));
    self.state = FrameState::new(creator, address, &Contract::new(init), vec![], true);
    self.result = None;
  }

  /// Returns to the idle state between transactions and hands back the outcome.
  pub fn end_tx(&mut self) -> Option<VMResult> {
    self.idle = true;
    self.frames.clear();
    self.state.stack.clear();
    self.state.memory.clear();
    self.result.take()
  }

  /// Restores the world as it was before the current transaction.
  fn revert_tx(&mut self) {
    self.contracts = self.tx_reversion.clone();
  }

  /// Executes one instruction. States split off at a symbolic branch are pushed onto `forks`.
  pub fn exec1(&mut self, solver: &dyn Solver, forks: &mut Vec<VM>) -> Result<(), SolverError> {
    if !self.is_running() {
      return Ok(());
    }
    match self.step(solver, forks) {
      Ok(()) => Ok(()),
      Err(StepError::Evm(e)) => {
        self.finish_frame(FrameResult::FrameErrored(e));
        Ok(())
      }
      Err(StepError::Solver(e)) => Err(e),
    }
  }

  fn step(&mut self, solver: &dyn Solver, forks: &mut Vec<VM>) -> Result<(), StepError> {
    let pc = self.state.pc;
    let Some(&byte) = self.state.code.get(pc) else {
      self.finish_frame(FrameResult::FrameReturned(vec![]));
      return Ok(());
    };
    let op = get_op(byte);
    trace!("state {} depth {} pc {}: {}", self.id, self.frames.len(), pc, op_string(&self.state.code, pc));

    match op {
      Op::Stop => self.finish_frame(FrameResult::FrameReturned(vec![])),
      Op::Add => self.stack_op2(|a, b| Expr::Add(a, b))?,
      Op::Mul => self.stack_op2(|a, b| Expr::Mul(a, b))?,
      Op::Sub => self.stack_op2(|a, b| Expr::Sub(a, b))?,
      Op::Div => self.stack_op2(|a, b| Expr::Div(a, b))?,
      Op::Mod => self.stack_op2(|a, b| Expr::Mod(a, b))?,
      Op::Lt => self.stack_op2(|a, b| Expr::LT(a, b))?,
      Op::Gt => self.stack_op2(|a, b| Expr::GT(a, b))?,
      Op::Eq => self.stack_op2(|a, b| Expr::Eq(a, b))?,
      Op::And => self.stack_op2(|a, b| Expr::And(a, b))?,
      Op::Or => self.stack_op2(|a, b| Expr::Or(a, b))?,
      Op::Xor => self.stack_op2(|a, b| Expr::Xor(a, b))?,
      Op::Shl => self.stack_op2(|a, b| Expr::SHL(a, b))?,
      Op::Shr => self.stack_op2(|a, b| Expr::SHR(a, b))?,
      Op::Iszero => self.stack_op1(Expr::IsZero)?,
      Op::Not => self.stack_op1(Expr::Not)?,
      Op::Address => self.push_next(Expr::Lit(self.state.code_address))?,
      Op::Caller => self.push_next(Expr::Lit(self.state.caller))?,
      Op::Callvalue => self.push_next(self.state.value.clone())?,
      Op::Pc => self.push_next(Expr::lit(pc as u64))?,
      Op::Gas => self.push_next(Expr::lit(GAS_PLACEHOLDER))?,
      Op::Calldatasize => self.push_next(Expr::lit(self.state.calldata.len() as u64))?,
      Op::Calldataload => {
        let offset = self.pop()?;
        let word = match simplify(&offset) {
          Expr::Lit(w) => w.to_usize().map(|o| read_word(&self.state.calldata, o)).unwrap_or(Expr::Lit(W256::ZERO)),
          _ => return Err(self.symbolic("CALLDATALOAD offset").into()),
        };
        self.push_next(word)?;
      }
      Op::Codecopy => {
        let dest = self.pop_usize("CODECOPY memory offset")?;
        let src = self.pop_usize("CODECOPY code offset")?;
        let size = self.pop_usize("CODECOPY size")?;
        let bytes: Vec<u8> = (0..size).map(|i| src.checked_add(i).and_then(|j| self.state.code.get(j)).copied().unwrap_or(0)).collect();
        self.write_memory(dest, &concrete_buf(&bytes))?;
        self.next(byte);
      }
      Op::Pop => {
        self.pop()?;
        self.next(byte);
      }
      Op::Mload => {
        let offset = self.pop_usize("MLOAD offset")?;
        self.expand_memory(offset, 32)?;
        let word = read_word(&self.state.memory, offset);
        self.push_next(word)?;
      }
      Op::Mstore => {
        let offset = self.pop_usize("MSTORE offset")?;
        let value = self.pop()?;
        self.write_memory(offset, &word_cells(&value))?;
        self.next(byte);
      }
      Op::Sload => {
        let key = self.pop()?;
        let storage = self.storage(&self.state.code_address);
        let value = simplify(&read_storage(&simplify(&key), &storage));
        self.push_next(value)?;
      }
      Op::Sstore => {
        if self.state.is_static {
          return Err(EvmError::StateChangeWhileStatic.into());
        }
        let key = simplify(&self.pop()?);
        let value = simplify(&self.pop()?);
        let address = self.state.code_address;
        let contract = self.contracts.entry(address).or_insert_with(|| Contract::new(vec![]));
        contract.storage = write_storage(&key, &value, &contract.storage);
        self.next(byte);
      }
      Op::Jump => {
        let target = self.pop()?;
        self.jump(&target)?;
      }
      Op::Jumpi => {
        let target = self.pop()?;
        let cond = simplify(&self.pop()?);
        self.branch(solver, forks, &target, cond, byte)?;
      }
      Op::Jumpdest => self.next(byte),
      Op::Push0 => self.push_next(Expr::Lit(W256::ZERO))?,
      Op::Push(n) => {
        let n = n as usize;
        let imm: Vec<u8> = (0..n).map(|i| self.state.code.get(pc + 1 + i).copied().unwrap_or(0)).collect();
        self.push_next(Expr::Lit(W256::from_bytes(imm)))?;
      }
      Op::Dup(n) => {
        let len = self.state.stack.len();
        let v = len.checked_sub(n as usize).and_then(|i| self.state.stack.get(i)).cloned().ok_or(EvmError::StackUnderrun)?;
        self.push_next(v)?;
      }
      Op::Swap(n) => {
        let len = self.state.stack.len();
        let other = len.checked_sub(n as usize + 1).ok_or(EvmError::StackUnderrun)?;
        self.state.stack.swap(len - 1, other);
        self.next(byte);
      }
      Op::Call | Op::Staticcall => self.call(op == Op::Staticcall)?,
      Op::Return => {
        let offset = self.pop_usize("RETURN offset")?;
        let size = self.pop_usize("RETURN size")?;
        let out = self.read_memory(offset, size)?;
        self.finish_frame(FrameResult::FrameReturned(out));
      }
      Op::Revert => {
        let offset = self.pop_usize("REVERT offset")?;
        let size = self.pop_usize("REVERT size")?;
        let out = self.read_memory(offset, size)?;
        self.finish_frame(FrameResult::FrameReverted(out));
      }
      Op::Invalid => return Err(EvmError::UnrecognizedOpcode(byte).into()),
      Op::Unknown(b) => return Err(EvmError::UnrecognizedOpcode(b).into()),
    }
    Ok(())
  }

  // Stack ----------------------------------------------------------------------------------------

  fn next(&mut self, byte: u8) {
    self.state.pc += op_size(byte);
  }

  fn pop(&mut self) -> Result<Expr, EvmError> {
    self.state.stack.pop().ok_or(EvmError::StackUnderrun)
  }

  fn push(&mut self, e: Expr) -> Result<(), EvmError> {
    if self.state.stack.len() >= STACK_LIMIT {
      return Err(EvmError::StackLimitExceeded);
    }
    self.state.stack.push(e);
    Ok(())
  }

  fn push_next(&mut self, e: Expr) -> Result<(), EvmError> {
    self.push(e)?;
    let byte = self.state.code.get(self.state.pc).copied().unwrap_or(0);
    self.next(byte);
    Ok(())
  }

  fn stack_op1(&mut self, f: impl FnOnce(Box<Expr>) -> Expr) -> Result<(), EvmError> {
    let a = self.pop()?;
    self.push_next(simplify(&f(Box::new(a))))
  }

  fn stack_op2(&mut self, f: impl FnOnce(Box<Expr>, Box<Expr>) -> Expr) -> Result<(), EvmError> {
    let a = self.pop()?;
    let b = self.pop()?;
    self.push_next(simplify(&f(Box::new(a), Box::new(b))))
  }

  fn symbolic(&self, what: &str) -> EvmError {
    EvmError::UnexpectedSymbolicArg { pc: self.state.pc, msg: what.to_string() }
  }

  fn force_concrete(&self, e: &Expr, what: &str) -> Result<W256, EvmError> {
    simplify(e).as_lit().ok_or_else(|| self.symbolic(what))
  }

  fn pop_usize(&mut self, what: &str) -> Result<usize, EvmError> {
    let e = self.pop()?;
    let w = self.force_concrete(&e, what)?;
    w.to_usize().ok_or(EvmError::InvalidMemoryAccess)
  }

  // Memory ---------------------------------------------------------------------------------------

  fn expand_memory(&mut self, offset: usize, size: usize) -> Result<(), EvmError> {
    if size == 0 {
      return Ok(());
    }
    let end = offset.checked_add(size).filter(|e| *e <= MEMORY_LIMIT).ok_or(EvmError::InvalidMemoryAccess)?;
    if self.state.memory.len() < end {
      self.state.memory.resize(end, Cell::Byte(0));
    }
    Ok(())
  }

  fn write_memory(&mut self, offset: usize, cells: &[Cell]) -> Result<(), EvmError> {
    self.expand_memory(offset, cells.len())?;
    self.state.memory[offset..offset + cells.len()].clone_from_slice(cells);
    Ok(())
  }

  fn read_memory(&mut self, offset: usize, size: usize) -> Result<Buf, EvmError> {
    self.expand_memory(offset, size)?;
    Ok(self.state.memory.get(offset..offset + size).map(|s| s.to_vec()).unwrap_or_default())
  }

  // Control flow ---------------------------------------------------------------------------------

  fn jump(&mut self, target: &Expr) -> Result<(), EvmError> {
    let dest = self.force_concrete(target, "jump destination")?;
    match dest.to_usize() {
      Some(d) if self.state.jumpdests.contains(&d) => {
        self.state.pc = d;
        Ok(())
      }
      _ => Err(EvmError::BadJumpDestination(dest)),
    }
  }

  /// Takes every feasible side of a conditional jump. When both are feasible this state jumps
  /// and a copy that falls through is pushed onto `forks`.
  fn branch(
    &mut self,
    solver: &dyn Solver,
    forks: &mut Vec<VM>,
    target: &Expr,
    cond: Expr,
    byte: u8,
  ) -> Result<(), StepError> {
    if let Expr::Lit(c) = cond {
      if c.is_zero() {
        self.next(byte);
      } else {
        self.jump(target)?;
      }
      return Ok(());
    }
    let then_prop = Prop::PNeg(Box::new(Prop::PEq(cond.clone(), Expr::Lit(W256::ZERO))));
    let else_prop = Prop::PEq(cond, Expr::Lit(W256::ZERO));
    let can_then = can_be_true(solver, &self.constraints, &then_prop)?;
    let can_else = can_be_true(solver, &self.constraints, &else_prop)?;
    match (can_then, can_else) {
      (true, true) => {
        let mut other = self.clone();
        other.constraints.push(else_prop);
        other.next(byte);
        forks.push(other);
        self.constraints.push(then_prop);
        self.jump(target)?;
      }
      (true, false) => {
        self.constraints.push(then_prop);
        self.jump(target)?;
      }
      (false, true) => {
        self.constraints.push(else_prop);
        self.next(byte);
      }
      (false, false) => return Err(EvmError::InfeasiblePath(self.state.pc).into()),
    }
    Ok(())
  }

  fn call(&mut self, is_static_call: bool) -> Result<(), EvmError> {
    let _gas = self.pop()?;
    let target = self.pop()?;
    let value = if is_static_call { Expr::Lit(W256::ZERO) } else { simplify(&self.pop()?) };
    let args_offset = self.pop_usize("call argument offset")?;
    let args_size = self.pop_usize("call argument size")?;
    let ret_offset = self.pop_usize("call return offset")?;
    let ret_size = self.pop_usize("call return size")?;
    let to = self.force_concrete(&target, "call target")?;

    if self.state.is_static && value != Expr::Lit(W256::ZERO) {
      return Err(EvmError::StateChangeWhileStatic);
    }
    let calldata = self.read_memory(args_offset, args_size)?;
    self.expand_memory(ret_offset, ret_size)?;
    let opcode = self.state.code.get(self.state.pc).copied().unwrap_or(0);

    if self.frames.len() >= self.max_call_depth {
      trace!("state {}: call to {} exceeds depth {}", self.id, to, self.max_call_depth);
      return self.push_next(Expr::Lit(W256::ZERO));
    }
    let callee = match self.contracts.get(&to) {
      Some(c) if c.has_code() => c.clone(),
      _ => return self.push_next(Expr::Lit(W256::ONE)),
    };

    self.next(opcode);
    let mut next = FrameState::new(self.state.code_address, to, &callee, calldata, false);
    next.value = value;
    next.is_static = self.state.is_static || is_static_call;
    let caller = std::mem::replace(&mut self.state, next);
    self.frames.push(Frame {
      state: caller,
      context: FrameContext::CallContext { offset: ret_offset, size: ret_size, callreversion: self.contracts.clone() },
    });
    Ok(())
  }

  fn finish_frame(&mut self, result: FrameResult) {
    match self.frames.pop() {
      None => {
        let outcome = match result {
          FrameResult::FrameReturned(out) if self.state.is_create => match concrete_bytes(&out) {
            Some(runtime) => {
              let storage = self.storage(&self.state.code_address);
              let mut installed = Contract::new(runtime);
              installed.storage = storage;
              self.contracts.insert(self.state.code_address, installed);
              VMResult::VMSuccess(vec![])
            }
            None => {
              self.revert_tx();
              VMResult::VMFailure(EvmError::InvalidFormat)
            }
          },
          FrameResult::FrameReturned(out) => VMResult::VMSuccess(out),
          FrameResult::FrameReverted(_) => {
            self.revert_tx();
            VMResult::VMFailure(EvmError::Revert)
          }
          FrameResult::FrameErrored(e) => {
            self.revert_tx();
            VMResult::VMFailure(e)
          }
        };
        self.result = Some(outcome);
      }
      Some(Frame { state, context: FrameContext::CallContext { offset, size, callreversion } }) => {
        self.state = state;
        let (status, out) = match result {
          FrameResult::FrameReturned(out) => (W256::ONE, out),
          FrameResult::FrameReverted(out) => {
            self.contracts = callreversion;
            (W256::ZERO, out)
          }
          FrameResult::FrameErrored(e @ (EvmError::UnexpectedSymbolicArg { .. } | EvmError::InfeasiblePath(_))) => {
            // not an EVM failure: the engine cannot continue this state at all
            self.frames.clear();
            self.finish_frame(FrameResult::FrameErrored(e));
            return;
          }
          FrameResult::FrameErrored(_) => {
            self.contracts = callreversion;
            (W256::ZERO, vec![])
          }
        };
        let n = size.min(out.len());
        if let Err(e) = self.write_memory(offset, &out[..n]).and_then(|_| self.push(Expr::Lit(status))) {
          self.finish_frame(FrameResult::FrameErrored(e));
        }
      }
    }
  }
}

impl StateView for VM {
  fn id(&self) -> StateId {
    self.id
  }

  fn current_tx(&self) -> Option<CallContext> {
    if !self.is_running() {
      return None;
    }
    Some(CallContext {
      is_create: self.state.is_create,
      code_address: self.state.code_address,
      caller: self.state.caller,
      depth: self.frames.len(),
    })
  }
}
