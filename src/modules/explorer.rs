use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::modules::abi::encode_call;
use crate::modules::effects::Config;
use crate::modules::engine::{Control, Engine, EngineError, Plugin, RunSummary, Transaction, TxArg};
use crate::modules::evm::{Contract, VMResult, VM};
use crate::modules::expr::{read_storage, simplify};
use crate::modules::solvers::{can_be_true, solve_value, Solver, SolverError};
use crate::modules::types::{Addr, EvmError, Expr, Prop, StateId, W256};

/// How far one state got before control came back to the explorer.
enum Advance {
  Finished(VM),
  Abandoned(VM),
  Forked(VM, Vec<VM>),
}

/// Runs `vm` until its transaction ends, a plugin abandons it, or it splits at a branch.
fn advance(mut vm: VM, solver: &dyn Solver, plugins: &[Arc<dyn Plugin>]) -> Result<Advance, SolverError> {
  let mut forks = vec![];
  while vm.is_running() {
    let pc = vm.pc();
    if plugins.iter().any(|p| p.on_instruction_decode(&vm, pc) == Control::Abandon) {
      return Ok(Advance::Abandoned(vm));
    }
    vm.exec1(solver, &mut forks)?;
    if !forks.is_empty() {
      return Ok(Advance::Forked(vm, forks));
    }
  }
  Ok(Advance::Finished(vm))
}

/// Multi-state symbolic engine: every live state runs each transaction, branching on symbolic
/// conditions. Plugins see every decoded instruction.
///
/// With more than one worker, states of the same level run concurrently. Under
/// `CounterScope::Global` siblings looping on the same decode point then race for one counter,
/// so which of them is abandoned, and so the live set after the run, can vary between runs.
pub struct Explorer<S: Solver> {
  config: Config,
  solver: S,
  plugins: Vec<Arc<dyn Plugin>>,
  states: Vec<VM>,
  accounts: BTreeSet<Addr>,
  next_id: usize,
  runs: usize,
}

impl<S: Solver> Explorer<S> {
  pub fn new(config: Config, solver: S) -> Self {
    let root = VM::new(StateId(0), config.max_call_depth);
    Explorer { config, solver, plugins: vec![], states: vec![root], accounts: BTreeSet::new(), next_id: 1, runs: 0 }
  }

  pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
    self.plugins.push(plugin);
  }

  /// Registers an externally owned account that may send transactions.
  pub fn create_account(&mut self, address: Addr) {
    self.accounts.insert(address);
  }

  fn has_code(&self, address: &Addr) -> bool {
    self.states.iter().any(|s| s.contracts.get(address).is_some_and(Contract::has_code))
  }

  /// Places `code` at `address` in every live state without running a constructor.
  pub fn install_runtime(&mut self, address: Addr, code: Vec<u8>) -> Result<(), EngineError> {
    if self.has_code(&address) {
      return Err(EngineError::AddressInUse(address));
    }
    let contract = Contract::new(code);
    for state in &mut self.states {
      state.contracts.insert(address, contract.clone());
    }
    debug!("installed {} bytes of runtime code at {}", contract.code.len(), address);
    Ok(())
  }

  /// Runs `init` as a creation transaction from `creator` in every live state.
  pub fn deploy(&mut self, creator: Addr, address: Addr, init: Vec<u8>) -> Result<RunSummary, EngineError> {
    if self.has_code(&address) {
      return Err(EngineError::AddressInUse(address));
    }
    let before = self.states.len();
    let summary = self.run(|vm| vm.begin_create(creator, address, init.clone()))?;
    if before > 0 && summary.completed == 0 {
      return Err(EngineError::DeploymentFailed {
        address,
        reason: format!("no state completed the constructor ({})", summary),
      });
    }
    info!("deployed {}: {}", address, summary);
    Ok(summary)
  }

  /// Splits `frontier` into at most `workers` contiguous chunks and advances each on its own thread.
  fn explore_level(&self, frontier: Vec<VM>) -> Result<Vec<Advance>, EngineError> {
    let workers = self.config.worker_count().min(frontier.len()).max(1);
    let chunk = frontier.len().div_ceil(workers);
    let mut chunks: Vec<Vec<VM>> = vec![];
    let mut rest = frontier.into_iter().peekable();
    while rest.peek().is_some() {
      chunks.push(rest.by_ref().take(chunk).collect());
    }

    let solver: &dyn Solver = &self.solver;
    let plugins = &self.plugins;
    let results = crossbeam::thread::scope(|scope| {
      let handles: Vec<_> = chunks
        .into_iter()
        .map(|states| {
          scope.spawn(move |_| {
            states.into_iter().map(|vm| advance(vm, solver, plugins)).collect::<Result<Vec<_>, _>>()
          })
        })
        .collect();
      handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    })
    .map_err(|_| EngineError::WorkerPanicked)?;

    let mut out = vec![];
    for r in results {
      out.extend(r.map_err(|_| EngineError::WorkerPanicked)??);
    }
    Ok(out)
  }

  /// One run: `start` begins a transaction in every live state, which is then explored to the end.
  /// On error the live set is left as it was before the run.
  fn run(&mut self, start: impl Fn(&mut VM)) -> Result<RunSummary, EngineError> {
    self.runs += 1;
    let mut summary = RunSummary { run: self.runs, ..RunSummary::default() };
    for plugin in &self.plugins {
      plugin.on_run_start();
    }

    let mut frontier = self.states.clone();
    for vm in &mut frontier {
      start(vm);
    }
    let finished = match self.explore(frontier, &mut summary) {
      Ok(finished) => finished,
      Err(e) => {
        warn!("run {} failed, keeping the {} states from before it: {}", summary.run, self.states.len(), e);
        return Err(e);
      }
    };

    let mut live = vec![];
    for mut vm in finished {
      match vm.end_tx() {
        Some(VMResult::VMSuccess(_)) | None => {
          summary.completed += 1;
          live.push(vm);
        }
        Some(VMResult::VMFailure(EvmError::Revert)) => {
          summary.reverted += 1;
          if self.config.keep_reverted {
            live.push(vm);
          }
        }
        Some(VMResult::VMFailure(e)) => {
          warn!("state {} dropped: {}", vm.id, e);
          summary.failed += 1;
        }
      }
    }
    live.sort_by_key(|vm| vm.id);
    self.states = live;
    Ok(summary)
  }

  /// Explores `frontier` level by level until every state has finished or been abandoned.
  fn explore(&mut self, mut frontier: Vec<VM>, summary: &mut RunSummary) -> Result<Vec<VM>, EngineError> {
    let mut finished = vec![];
    while !frontier.is_empty() {
      let mut next = vec![];
      for step in self.explore_level(frontier)? {
        match step {
          Advance::Finished(vm) => finished.push(vm),
          Advance::Abandoned(vm) => {
            debug!("state {} abandoned at pc {}", vm.id, vm.pc());
            summary.abandoned += 1;
          }
          Advance::Forked(vm, children) => {
            for mut child in children {
              child.id = StateId(self.next_id);
              self.next_id += 1;
              for plugin in &self.plugins {
                plugin.on_state_fork(vm.id, child.id);
              }
              summary.forks += 1;
              next.push(child);
            }
            next.push(vm);
          }
        }
      }
      frontier = next;
    }
    Ok(finished)
  }

  fn calldata_args(&self, tx: &Transaction, run: usize) -> Vec<Expr> {
    tx.args
      .iter()
      .enumerate()
      .map(|(i, arg)| match arg {
        TxArg::Word(w) => Expr::Lit(*w),
        TxArg::Symbolic => Expr::Var(format!("tx{}_arg{}", run, i)),
      })
      .collect()
  }
}

impl<S: Solver> Engine for Explorer<S> {
  type State = VM;
  type Error = EngineError;

  fn live_states(&self) -> &[VM] {
    &self.states
  }

  fn read_storage(&self, state: &VM, address: Addr, slot: W256) -> Expr {
    simplify(&read_storage(&Expr::Lit(slot), &state.storage(&address)))
  }

  fn can_be_true(&self, state: &VM, prop: &Prop) -> Result<bool, EngineError> {
    Ok(can_be_true(&self.solver, &state.constraints, prop)?)
  }

  fn solve_one(&self, state: &VM, expr: &Expr, extra: &[Prop]) -> Result<Option<W256>, EngineError> {
    let mut constraints = state.constraints.clone();
    constraints.extend_from_slice(extra);
    Ok(solve_value(&self.solver, &constraints, expr)?)
  }

  fn transact(&mut self, tx: &Transaction) -> Result<RunSummary, EngineError> {
    if !self.has_code(&tx.to) && !self.accounts.contains(&tx.to) && !self.states.is_empty() {
      return Err(EngineError::UnknownAccount(tx.to));
    }
    let args = self.calldata_args(tx, self.runs + 1);
    let calldata = encode_call(&tx.signature, &args)?;
    debug!("transaction {} over {} live state(s)", tx, self.states.len());
    let summary = self.run(|vm| vm.begin_call(tx.caller, tx.to, calldata.clone()))?;
    info!("{}: {}", tx.signature, summary);
    Ok(summary)
  }
}
