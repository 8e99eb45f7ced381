use getopts::Options;
use log::LevelFilter;
use std::path::PathBuf;
use thiserror::Error;

use crate::modules::effects::Config;
use crate::modules::limiter::CounterScope;

#[derive(Debug, Error)]
pub enum CliError {
  #[error(transparent)]
  Options(#[from] getopts::Fail),
  #[error("a SCENARIO file is required")]
  MissingScenario,
  #[error("unexpected argument `{0}`")]
  UnexpectedArgument(String),
  #[error("invalid value `{value}` for --{flag}")]
  InvalidValue { flag: &'static str, value: String },
  #[error("{0}")]
  Scope(String),
}

/// Parsed command line. Settings left unset here keep whatever the scenario file (or the
/// defaults) chose.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Command {
  pub scenario: PathBuf,
  pub threshold: Option<usize>,
  pub scope: Option<CounterScope>,
  pub workers: Option<usize>,
  pub solver: Option<String>,
  pub timeout: Option<u64>,
  pub keep_reverted: bool,
  pub dump_queries: bool,
  pub verbose: Option<String>,
  pub help: bool,
}

pub fn options() -> Options {
  let mut opts = Options::new();
  opts.optopt("t", "threshold", "visits of one program point allowed per run (default: 5)", "N");
  opts.optopt("s", "scope", "visit counter scope: global or path (default: global)", "SCOPE");
  opts.optopt("j", "workers", "worker threads (default: number of CPUs)", "N");
  opts.optopt("", "solver", "path to the z3 binary (default: z3)", "PATH");
  opts.optopt("", "timeout", "per-query solver timeout", "SECS");
  opts.optflag("", "keep-reverted", "keep reverted states alive");
  opts.optflag("", "dump-queries", "write every solver query under the query directory");
  opts.optopt("v", "verbose", "log level: 0-4 or error, warn, info, debug, trace", "LEVEL");
  opts.optflag("h", "help", "print this help menu");
  opts
}

pub fn usage(program: &str) -> String {
  let brief = format!("Usage: {} SCENARIO [options]", program);
  options().usage(&brief)
}

fn parse_number<T: std::str::FromStr>(flag: &'static str, value: Option<String>) -> Result<Option<T>, CliError> {
  value.map(|v| v.parse().map_err(|_| CliError::InvalidValue { flag, value: v })).transpose()
}

/// Parses the arguments following the program name.
pub fn parse_command(args: &[String]) -> Result<Command, CliError> {
  let matches = options().parse(args)?;
  let help = matches.opt_present("h");

  let mut free = matches.free.iter().cloned();
  let scenario = match free.next() {
    Some(path) => PathBuf::from(path),
    None if help => PathBuf::new(),
    None => return Err(CliError::MissingScenario),
  };
  if let Some(extra) = free.next() {
    return Err(CliError::UnexpectedArgument(extra));
  }

  let scope = matches.opt_str("s").map(|s| s.parse::<CounterScope>()).transpose().map_err(CliError::Scope)?;
  let verbose = matches.opt_str("v");
  if let Some(level) = &verbose {
    if log_level(level).is_none() {
      return Err(CliError::InvalidValue { flag: "verbose", value: level.clone() });
    }
  }

  Ok(Command {
    scenario,
    threshold: parse_number("threshold", matches.opt_str("t"))?,
    scope,
    workers: parse_number("workers", matches.opt_str("j"))?,
    solver: matches.opt_str("solver"),
    timeout: parse_number("timeout", matches.opt_str("timeout"))?,
    keep_reverted: matches.opt_present("keep-reverted"),
    dump_queries: matches.opt_present("dump-queries"),
    verbose,
    help,
  })
}

/// Maps a `-v` argument to a log filter.
pub fn log_level(level: &str) -> Option<LevelFilter> {
  match level.to_ascii_lowercase().as_str() {
    "0" | "error" => Some(LevelFilter::Error),
    "1" | "warn" => Some(LevelFilter::Warn),
    "2" | "info" => Some(LevelFilter::Info),
    "3" | "debug" => Some(LevelFilter::Debug),
    "4" | "trace" => Some(LevelFilter::Trace),
    _ => None,
  }
}

impl Command {
  /// Applies the flags that were given on top of `config`.
  pub fn apply(&self, config: &mut Config) {
    if let Some(t) = self.threshold {
      config.threshold = t;
    }
    if let Some(s) = self.scope {
      config.counter_scope = s;
    }
    if let Some(j) = self.workers {
      config.workers = j;
    }
    if let Some(path) = &self.solver {
      config.solver = path.clone();
    }
    if self.timeout.is_some() {
      config.solver_timeout = self.timeout;
    }
    config.keep_reverted |= self.keep_reverted;
    config.dump_queries |= self.dump_queries;
  }
}
