//! Command-line configuration. Every flag is optional; the defaults run the
//! fixed one-million-request benchmark.

use thiserror::Error;
use tracing::Level;

use crate::{BASELINE_SEED, DEFAULT_OPS, POOLED_SEED};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("help requested")]
  HelpRequested,
  #[error("unknown option: {0}")]
  UnknownFlag(String),
  #[error("missing value for {0}")]
  MissingValue(String),
  #[error("invalid value for {flag}: {value:?}")]
  InvalidNumber { flag: String, value: String },
  #[error("--ops must be at least 1")]
  ZeroOps,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Requests per strategy.
  pub ops: usize,
  pub baseline_seed: u64,
  pub pooled_seed: u64,
  /// Sample RSS after every request. Off means the null sampler.
  pub sample_rss: bool,
  /// 0 = info, positive is chattier, negative quieter.
  pub verbosity: i8,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      ops: DEFAULT_OPS,
      baseline_seed: BASELINE_SEED,
      pooled_seed: POOLED_SEED,
      sample_rss: true,
      verbosity: 0,
    }
  }
}

impl Config {
  /// Parses flags, program name already stripped.
  pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut config = Self::default();
    let mut args = args.into_iter().map(Into::into);

    while let Some(arg) = args.next() {
      match arg.as_str() {
        "-h" | "--help" => return Err(ConfigError::HelpRequested),
        "--ops" => config.ops = parse_number(&arg, args.next())?,
        "--seed-baseline" => config.baseline_seed = parse_number(&arg, args.next())?,
        "--seed-pooled" => config.pooled_seed = parse_number(&arg, args.next())?,
        "--no-rss" => config.sample_rss = false,
        "-v" => config.verbosity = config.verbosity.saturating_add(1),
        "-q" => config.verbosity = config.verbosity.saturating_sub(1),
        _ => return Err(ConfigError::UnknownFlag(arg)),
      }
    }

    if config.ops == 0 {
      return Err(ConfigError::ZeroOps);
    }

    Ok(config)
  }

  pub fn log_level(&self) -> Level {
    match self.verbosity {
      i8::MIN..=-2 => Level::ERROR,
      -1 => Level::WARN,
      0 => Level::INFO,
      1 => Level::DEBUG,
      _ => Level::TRACE,
    }
  }

  pub fn usage(prog: &str) -> String {
    format!(
      "Fragmentation vs. pooled allocation benchmark\n\n\
       USAGE:\n    {prog} [OPTIONS]\n\n\
       OPTIONS:\n    \
       --ops <N>              Requests per strategy [default: {DEFAULT_OPS}]\n    \
       --seed-baseline <S>    Baseline size/eviction seed [default: {BASELINE_SEED}]\n    \
       --seed-pooled <S>      Pooled size seed [default: {POOLED_SEED}]\n    \
       --no-rss               Skip RSS sampling (time the loops alone)\n    \
       -v / -q                More / less logging on stderr (RUST_LOG overrides)\n    \
       -h, --help             Print help information"
    )
  }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, ConfigError> {
  let value = value.ok_or_else(|| ConfigError::MissingValue(flag.to_string()))?;
  value
    .replace('_', "")
    .parse()
    .map_err(|_| ConfigError::InvalidNumber {
      flag: flag.to_string(),
      value,
    })
}
