use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::modules::asm::{assemble, init_code, AsmError};
use crate::modules::effects::Config;
use crate::modules::engine::{Engine, EngineError, RunSummary, Transaction, TxArg};
use crate::modules::explorer::Explorer;
use crate::modules::format::hex_byte_string;
use crate::modules::invariant::{counterexample, exists, for_all, probe, Predicate, Witness};
use crate::modules::limiter::DepthLimiter;
use crate::modules::solvers::{Solver, Z3};
use crate::modules::types::{Addr, W256};

#[derive(Debug, Error)]
pub enum ScenarioError {
  #[error("cannot read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("malformed scenario: {0}")]
  Json(#[from] serde_json::Error),
  #[error("contract `{name}`: {source}")]
  Asm {
    name: String,
    #[source]
    source: AsmError,
  },
  #[error("contract `{name}`: bad hex code: {source}")]
  Hex {
    name: String,
    #[source]
    source: hex::FromHexError,
  },
  #[error("`{0}` is neither a known account, a contract, nor an address")]
  UnknownName(String),
  #[error("name `{0}` is declared twice")]
  DuplicateName(String),
  #[error("step {step}: {source}")]
  Engine {
    step: usize,
    #[source]
    source: EngineError,
  },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
  #[serde(default)]
  pub config: Config,
  #[serde(default)]
  pub accounts: BTreeMap<String, W256>,
  #[serde(default)]
  pub contracts: Vec<ContractSpec>,
  #[serde(default)]
  pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AsmSource {
  Text(String),
  Lines(Vec<String>),
}

impl AsmSource {
  fn text(&self) -> String {
    match self {
      AsmSource::Text(t) => t.clone(),
      AsmSource::Lines(lines) => lines.join("\n"),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSpec {
  /// Creation code, run as a creation transaction.
  Init(String),
  /// Runtime code placed directly at the address.
  Runtime(String),
  /// Assembly; the constructor (if any) runs in a creation transaction that installs `runtime`.
  Asm { runtime: AsmSource, constructor: Option<AsmSource> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractSpec {
  pub name: String,
  pub address: W256,
  #[serde(default)]
  pub creator: Option<String>,
  #[serde(flatten)]
  pub code: CodeSpec,
}

/// A transaction argument: a number, an account or contract name, or `"symbolic"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
  Num(u64),
  Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantifier {
  Forall,
  Exists,
}

impl fmt::Display for Quantifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Quantifier::Forall => write!(f, "forall"),
      Quantifier::Exists => write!(f, "exists"),
    }
  }
}

fn expect_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
  Transact {
    caller: String,
    to: String,
    signature: String,
    #[serde(default)]
    args: Vec<ArgSpec>,
  },
  Probe {
    observer: String,
    method: String,
    target: String,
    argument: ArgSpec,
    caller: String,
  },
  Assert {
    quantifier: Quantifier,
    contract: String,
    #[serde(default)]
    slot: W256,
    predicate: Predicate,
    #[serde(default = "expect_true")]
    expect: bool,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
  pub step: usize,
  pub description: String,
  /// A state and slot value demonstrating the unexpected outcome, when one exists.
  pub witness: Option<Witness>,
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "step {}: {}", self.step, self.description)?;
    if let Some(w) = &self.witness {
      write!(f, " (state {}, value {})", w.state, w.value)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
  pub runs: Vec<RunSummary>,
  pub assertions: usize,
  pub violations: Vec<Violation>,
}

impl Report {
  pub fn passed(&self) -> bool {
    self.violations.is_empty()
  }
}

pub fn load(path: &Path) -> Result<Scenario, ScenarioError> {
  let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io { path: path.to_path_buf(), source })?;
  Ok(serde_json::from_str(&text)?)
}

/// An explorer with the depth limiter configured from `config` already registered.
pub fn prepare<S: Solver>(config: Config, solver: S) -> Explorer<S> {
  let limiter = DepthLimiter::with_scope(config.threshold, config.counter_scope);
  let mut engine = Explorer::new(config, solver);
  engine.register_plugin(Arc::new(limiter));
  engine
}

/// Runs `scenario` against z3 with `config`.
pub fn run_scenario(scenario: &Scenario, config: Config) -> Result<Report, ScenarioError> {
  let query_dir = config.dump_queries.then_some(config.query_dir.as_path());
  let solver = Z3::new(&config.solver).with_timeout(config.solver_timeout).dump_queries_to(query_dir);
  let mut engine = prepare(config.clone(), solver);
  run(scenario, &mut engine)
}

struct Names {
  table: BTreeMap<String, Addr>,
}

impl Names {
  fn build(scenario: &Scenario) -> Result<Self, ScenarioError> {
    let mut table = BTreeMap::new();
    let declared =
      scenario.accounts.iter().map(|(n, a)| (n, *a)).chain(scenario.contracts.iter().map(|c| (&c.name, c.address)));
    for (name, address) in declared {
      if table.insert(name.clone(), address).is_some() {
        return Err(ScenarioError::DuplicateName(name.clone()));
      }
    }
    Ok(Names { table })
  }

  fn resolve(&self, name: &str) -> Result<Addr, ScenarioError> {
    match self.table.get(name) {
      Some(a) => Ok(*a),
      None => name.parse().map_err(|_| ScenarioError::UnknownName(name.to_string())),
    }
  }

  fn arg(&self, spec: &ArgSpec) -> Result<TxArg, ScenarioError> {
    match spec {
      ArgSpec::Num(n) => Ok(TxArg::Word(W256::from_u64(*n))),
      ArgSpec::Text(t) if t == "symbolic" => Ok(TxArg::Symbolic),
      ArgSpec::Text(t) => self.resolve(t).map(TxArg::Word),
    }
  }
}

fn setup<S: Solver>(scenario: &Scenario, names: &Names, engine: &mut Explorer<S>, report: &mut Report) -> Result<(), ScenarioError> {
  for address in scenario.accounts.values() {
    engine.create_account(*address);
  }
  for spec in &scenario.contracts {
    let creator = match &spec.creator {
      Some(c) => names.resolve(c)?,
      None => W256::ZERO,
    };
    let hex_err = |source| ScenarioError::Hex { name: spec.name.clone(), source };
    let asm_err = |source| ScenarioError::Asm { name: spec.name.clone(), source };
    let engine_err = |source| ScenarioError::Engine { step: 0, source };
    match &spec.code {
      CodeSpec::Runtime(hex) => {
        engine.install_runtime(spec.address, hex_byte_string(hex).map_err(hex_err)?).map_err(engine_err)?;
      }
      CodeSpec::Init(hex) => {
        let summary = engine.deploy(creator, spec.address, hex_byte_string(hex).map_err(hex_err)?).map_err(engine_err)?;
        report.runs.push(summary);
      }
      CodeSpec::Asm { runtime, constructor } => {
        let runtime = assemble(&runtime.text()).map_err(asm_err)?;
        let constructor = match constructor {
          Some(src) => assemble(&src.text()).map_err(asm_err)?,
          None => vec![],
        };
        let init = init_code(&constructor, &runtime).map_err(asm_err)?;
        let summary = engine.deploy(creator, spec.address, init).map_err(engine_err)?;
        report.runs.push(summary);
      }
    }
    info!("contract {} at {}", spec.name, spec.address);
  }
  Ok(())
}

/// Deploys the scenario's contracts, then runs its steps in order. Failed assertions are
/// collected in the report; engine errors stop the scenario.
pub fn run<S: Solver>(scenario: &Scenario, engine: &mut Explorer<S>) -> Result<Report, ScenarioError> {
  let names = Names::build(scenario)?;
  let mut report = Report::default();
  setup(scenario, &names, engine, &mut report)?;

  for (i, step) in scenario.steps.iter().enumerate() {
    let n = i + 1;
    let engine_err = |source| ScenarioError::Engine { step: n, source };
    match step {
      Step::Transact { caller, to, signature, args } => {
        let tx = Transaction {
          caller: names.resolve(caller)?,
          to: names.resolve(to)?,
          signature: signature.clone(),
          args: args.iter().map(|a| names.arg(a)).collect::<Result<_, _>>()?,
        };
        report.runs.push(engine.transact(&tx).map_err(engine_err)?);
      }
      Step::Probe { observer, method, target, argument, caller } => {
        let summary = probe(
          engine,
          names.resolve(observer)?,
          method,
          names.resolve(target)?,
          names.arg(argument)?,
          names.resolve(caller)?,
        )
        .map_err(engine_err)?;
        report.runs.push(summary);
      }
      Step::Assert { quantifier, contract, slot, predicate, expect } => {
        report.assertions += 1;
        let address = names.resolve(contract)?;
        let holds = match quantifier {
          Quantifier::Forall => for_all(&*engine, address, *slot, predicate),
          Quantifier::Exists => exists(&*engine, address, *slot, predicate),
        }
        .map_err(engine_err)?;
        if holds == *expect {
          info!("step {}: {} {} over {} state(s) is {}", n, quantifier, predicate, engine.live_states().len(), holds);
          continue;
        }
        // a state where the outcome differs from the expectation
        let witness = match (quantifier, holds) {
          (Quantifier::Forall, false) => counterexample(&*engine, address, *slot, predicate),
          (Quantifier::Exists, true) => counterexample(&*engine, address, *slot, &predicate.negate()),
          _ => Ok(None),
        }
        .map_err(engine_err)?;
        let violation = Violation {
          step: n,
          description: format!(
            "{} `{}` on slot {} of {} is {}, expected {}",
            quantifier, predicate, slot, contract, holds, expect
          ),
          witness,
        };
        warn!("{}", violation);
        report.violations.push(violation);
      }
    }
  }
  Ok(report)
}
