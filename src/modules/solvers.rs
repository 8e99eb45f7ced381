use log::{debug, trace};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::modules::expr::{eval_prop, simplify, simplify_prop};
use crate::modules::smt::{assert_props, parse_z3_value, value_query, SMT2};
use crate::modules::types::{Expr, Prop, W256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckSatResult {
  Sat,
  Unsat,
  Unknown,
}

#[derive(Debug, Error)]
pub enum SolverError {
  #[error("could not run solver `{solver}`: {source}")]
  Io {
    solver: String,
    #[source]
    source: std::io::Error,
  },
  #[error("solver `{solver}` failed: {stderr}")]
  CommandError { solver: String, stderr: String },
  #[error("unrecognized solver response: {0}")]
  UnknownResult(String),
  #[error("solver could not decide the query (timeout or incomplete theory)")]
  Inconclusive,
}

/// A decision procedure over path constraints.
pub trait Solver: Send + Sync {
  fn check_sat(&self, props: &[Prop]) -> Result<CheckSatResult, SolverError>;

  /// One value `expr` can take under `props`, or `None` when `props` are unsatisfiable.
  fn get_value(&self, props: &[Prop], expr: &Expr) -> Result<Option<W256>, SolverError>;
}

/// z3 run as a child process per query, fed over stdin.
#[derive(Debug)]
pub struct Z3 {
  path: String,
  timeout: Option<u64>,
  dump_dir: Option<PathBuf>,
  counter: AtomicUsize,
}

impl Z3 {
  pub fn new(path: &str) -> Self {
    Z3 { path: path.to_string(), timeout: None, dump_dir: None, counter: AtomicUsize::new(0) }
  }

  /// Per-query timeout in seconds.
  pub fn with_timeout(mut self, secs: Option<u64>) -> Self {
    self.timeout = secs;
    self
  }

  /// Writes every query to `dir/query-N.smt2` before running it.
  pub fn dump_queries_to(mut self, dir: Option<&Path>) -> Self {
    self.dump_dir = dir.map(Path::to_path_buf);
    self
  }

  fn dump(&self, script: &str) {
    let Some(dir) = &self.dump_dir else {
      return;
    };
    let n = self.counter.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = fs::create_dir_all(dir) {
      debug!("could not create query directory {}: {}", dir.display(), e);
      return;
    }
    let file = dir.join(format!("query-{}.smt2", n));
    if let Err(e) = fs::write(&file, script) {
      debug!("could not dump query to {}: {}", file.display(), e);
    }
  }

  fn run(&self, script: &str) -> Result<String, SolverError> {
    self.dump(script);
    let mut cmd = Command::new(&self.path);
    cmd.args(["-in", "-smt2"]);
    if let Some(t) = self.timeout {
      cmd.arg(format!("-T:{}", t));
    }
    let io_err = |source| SolverError::Io { solver: self.path.clone(), source };
    let mut child = cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn().map_err(io_err)?;
    if let Some(mut stdin) = child.stdin.take() {
      stdin.write_all(script.as_bytes()).map_err(io_err)?;
    }
    let output = child.wait_with_output().map_err(io_err)?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!("{} answered: {}", self.path, stdout.trim());
    // z3 exits non-zero on a timeout but still reports on stdout
    if !output.status.success() && stdout.trim().is_empty() {
      return Err(SolverError::CommandError {
        solver: self.path.clone(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(stdout)
  }
}

fn parse_check_sat(stdout: &str) -> Result<CheckSatResult, SolverError> {
  match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
    Some("sat") => Ok(CheckSatResult::Sat),
    Some("unsat") => Ok(CheckSatResult::Unsat),
    Some("unknown") | Some("timeout") => Ok(CheckSatResult::Unknown),
    other => Err(SolverError::UnknownResult(other.unwrap_or_default().to_string())),
  }
}

impl Solver for Z3 {
  fn check_sat(&self, props: &[Prop]) -> Result<CheckSatResult, SolverError> {
    let mut smt: SMT2 = assert_props(props);
    smt.push("(check-sat)".to_string());
    parse_check_sat(&self.run(&smt.to_string())?)
  }

  fn get_value(&self, props: &[Prop], expr: &Expr) -> Result<Option<W256>, SolverError> {
    let stdout = self.run(&value_query(props, expr).to_string())?;
    match parse_check_sat(&stdout)? {
      CheckSatResult::Unsat => Ok(None),
      CheckSatResult::Unknown => Err(SolverError::Inconclusive),
      CheckSatResult::Sat => parse_z3_value(&stdout).map(Some).ok_or(SolverError::UnknownResult(stdout)),
    }
  }
}

/// Drops constraints that fold to `true`; `None` when one folds to `false`.
fn fold_constraints(props: &[Prop]) -> Option<Vec<Prop>> {
  let mut open = vec![];
  for p in props {
    match simplify_prop(p) {
      Prop::PBool(true) => {}
      Prop::PBool(false) => return None,
      p => open.push(p),
    }
  }
  Some(open)
}

/// Whether `prop` can hold together with `constraints`. Constant queries never reach the solver;
/// an `unknown` answer is an error rather than a guess.
pub fn can_be_true(solver: &dyn Solver, constraints: &[Prop], prop: &Prop) -> Result<bool, SolverError> {
  let Some(mut open) = fold_constraints(constraints) else {
    return Ok(false);
  };
  match eval_prop(prop) {
    Some(false) => return Ok(false),
    Some(true) if open.is_empty() => return Ok(true),
    Some(true) => {}
    None => open.push(simplify_prop(prop)),
  }
  match solver.check_sat(&open)? {
    CheckSatResult::Sat => Ok(true),
    CheckSatResult::Unsat => Ok(false),
    CheckSatResult::Unknown => Err(SolverError::Inconclusive),
  }
}

/// One model value of `expr`, skipping the solver when it is already constant.
pub fn solve_value(solver: &dyn Solver, constraints: &[Prop], expr: &Expr) -> Result<Option<W256>, SolverError> {
  let Some(open) = fold_constraints(constraints) else {
    return Ok(None);
  };
  match simplify(expr) {
    Expr::Lit(w) if open.is_empty() => Ok(Some(w)),
    e => solver.get_value(&open, &e),
  }
}
