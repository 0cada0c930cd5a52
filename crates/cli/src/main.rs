mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use polyversion_lib::config::parse_override;

/// polyversion - Build multiple versions of your docs and merge them into one site
#[derive(Parser, Debug)]
#[command(name = "polyversion")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Configuration file to load (TOML)
  conf: PathBuf,

  /// Output directory to build the merged docs to
  out: Option<PathBuf>,

  /// Override a config option, as a `key=value` pair (dotted keys for sections); repeatable
  #[arg(
    short = 'o',
    long = "override",
    value_name = "KEY=VALUE",
    value_parser = parse_override_arg,
    action = clap::ArgAction::Append
  )]
  overrides: Vec<(String, String)>,

  /// Increase output verbosity (the default log level is error)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Build the local working tree only, using the configured mock data
  #[arg(short, long, visible_alias = "mock")]
  local: bool,

  /// Build the revisions one at a time
  #[arg(long)]
  sequential: bool,

  /// Print the run summary as JSON
  #[arg(long)]
  json: bool,
}

fn parse_override_arg(text: &str) -> Result<(String, String), String> {
  parse_override(text).map_err(|e| e.to_string())
}

fn log_level(verbose: u8) -> &'static str {
  match verbose {
    0 => "error",
    1 => "warn",
    2 => "info",
    3 => "debug",
    _ => "trace",
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  // RUST_LOG wins over -v
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(cli.verbose)));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let options = cmd::BuildOptions {
    conf: cli.conf,
    out: cli.out,
    overrides: cli.overrides,
    local: cli.local,
    sequential: cli.sequential,
    json: cli.json,
  };

  let runtime = tokio::runtime::Runtime::new()?;
  runtime.block_on(cmd::cmd_build(options))
}
