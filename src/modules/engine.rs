//! The narrow surface between the exploration core (depth limiting, multi-state invariants) and
//! whatever symbolic engine drives execution.

use std::fmt;
use thiserror::Error;

use crate::modules::abi::AbiError;
use crate::modules::solvers::SolverError;
use crate::modules::types::{Addr, CallContext, Expr, Prop, StateId, W256};

/// What a plugin sees of the state about to decode an instruction.
pub trait StateView {
  fn id(&self) -> StateId;

  /// The innermost active call frame, `None` between transactions.
  fn current_tx(&self) -> Option<CallContext>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
  Continue,
  Abandon,
}

/// Hooks an engine invokes while exploring. Implementations are shared by every worker thread.
pub trait Plugin: Send + Sync {
  /// Called once per run, before the first decode callback of that run.
  fn on_run_start(&self);

  /// Called before decoding the instruction at `pc`. `Control::Abandon` removes the state from
  /// exploration; no further callbacks fire for it.
  fn on_instruction_decode(&self, state: &dyn StateView, pc: usize) -> Control;

  /// `child` was split off `parent` at a branch.
  fn on_state_fork(&self, _parent: StateId, _child: StateId) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxArg {
  Word(W256),
  /// A fresh unconstrained 256-bit word.
  Symbolic,
}

impl fmt::Display for TxArg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TxArg::Word(w) => write!(f, "{}", w),
      TxArg::Symbolic => write!(f, "<symbolic>"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
  pub caller: Addr,
  pub to: Addr,
  pub signature: String,
  pub args: Vec<TxArg>,
}

impl fmt::Display for Transaction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
    write!(f, "{} -> {}.{} [{}]", self.caller, self.to, self.signature, args.join(", "))
  }
}

/// Outcome counts of one run, i.e. one transaction applied to every live state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub run: usize,
  pub completed: usize,
  pub reverted: usize,
  pub abandoned: usize,
  pub failed: usize,
  pub forks: usize,
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "run {}: {} completed, {} reverted, {} abandoned, {} failed, {} forks",
      self.run, self.completed, self.reverted, self.abandoned, self.failed, self.forks
    )
  }
}

/// The capabilities the invariant evaluator needs from an engine.
pub trait Engine {
  type State: StateView;
  type Error;

  /// Live states in a stable order.
  fn live_states(&self) -> &[Self::State];

  /// Symbolic value of `slot` in the storage of `address` as seen by `state`.
  fn read_storage(&self, state: &Self::State, address: Addr, slot: W256) -> Expr;

  /// Whether `prop` is satisfiable together with the path condition of `state`.
  fn can_be_true(&self, state: &Self::State, prop: &Prop) -> Result<bool, Self::Error>;

  /// One concrete value of `expr` under the path condition of `state` plus `extra`.
  fn solve_one(&self, state: &Self::State, expr: &Expr, extra: &[Prop]) -> Result<Option<W256>, Self::Error>;

  /// Applies `tx` to every live state.
  fn transact(&mut self, tx: &Transaction) -> Result<RunSummary, Self::Error>;
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Solver(#[from] SolverError),
  #[error(transparent)]
  Abi(#[from] AbiError),
  #[error("no account at {0}")]
  UnknownAccount(Addr),
  #[error("address {0} already holds code")]
  AddressInUse(Addr),
  #[error("deployment at {address} failed: {reason}")]
  DeploymentFailed { address: Addr, reason: String },
  #[error("an exploration worker panicked")]
  WorkerPanicked,
}
