use log::{error, info, warn, LevelFilter};
use std::{env, process};

use rhoguard::modules::cli::{log_level, parse_command, usage};
use rhoguard::modules::scenario::{load, run_scenario};

fn main() {
  let args: Vec<String> = env::args().collect();
  let program = args.first().cloned().unwrap_or_else(|| "rhoguard".to_string());

  let cmd = match parse_command(args.get(1..).unwrap_or_default()) {
    Ok(cmd) => cmd,
    Err(e) => {
      eprintln!("Error: {}", e);
      eprint!("{}", usage(&program));
      process::exit(2);
    }
  };
  if cmd.help {
    print!("{}", usage(&program));
    process::exit(0);
  }

  // Set the verbose level
  let level = cmd.verbose.as_deref().and_then(log_level).unwrap_or(LevelFilter::Info);
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str())).init();

  info!("Loading scenario from file: {}", cmd.scenario.display());
  let scenario = match load(&cmd.scenario) {
    Ok(s) => s,
    Err(e) => {
      error!("{}", e);
      process::exit(2);
    }
  };
  let mut config = scenario.config.clone();
  cmd.apply(&mut config);
  info!(
    "threshold {} ({:?} counters), {} worker(s), solver {}",
    config.threshold,
    config.counter_scope,
    config.worker_count(),
    config.solver
  );

  let report = match run_scenario(&scenario, config) {
    Ok(r) => r,
    Err(e) => {
      error!("{}", e);
      process::exit(2);
    }
  };

  for run in &report.runs {
    println!("{}", run);
  }
  if report.passed() {
    println!("{} assertion(s) passed", report.assertions);
    return;
  }
  for v in &report.violations {
    println!("violation: {}", v);
  }
  warn!("{} of {} assertion(s) failed", report.violations.len(), report.assertions);
  process::exit(1);
}
