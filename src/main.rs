use std::{error::Error, io::Write, process::ExitCode};

use fragbench::{Config, ConfigError, MemorySampler, NullSampler, Report, platform_sampler, run_all};
use tracing::{Level, error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; stdout carries only the report.
fn init_logging(level: Level) {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::from_level(level).into())
    .from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();
}

fn run(config: &Config) -> Result<(), Box<dyn Error>> {
  let mut sampler: Box<dyn MemorySampler> = if config.sample_rss {
    platform_sampler()
  } else {
    Box::new(NullSampler)
  };
  info!(ops = config.ops, sampler = sampler.name(), "benchmark starting");

  let results = run_all(config, sampler.as_mut());
  let report = Report::new(config.ops, results);

  let mut out = std::io::stdout().lock();
  write!(out, "{report}")?;
  out.flush()?;
  Ok(())
}

fn main() -> ExitCode {
  let prog = std::env::args().next().unwrap_or_else(|| "fragbench".to_string());

  let config = match Config::from_args(std::env::args().skip(1)) {
    Ok(config) => config,
    Err(ConfigError::HelpRequested) => {
      println!("{}", Config::usage(&prog));
      return ExitCode::SUCCESS;
    }
    Err(err) => {
      eprintln!("error: {err}\n\n{}", Config::usage(&prog));
      return ExitCode::from(2);
    }
  };

  init_logging(config.log_level());

  match run(&config) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!(%err, "benchmark failed");
      ExitCode::FAILURE
    }
  }
}
