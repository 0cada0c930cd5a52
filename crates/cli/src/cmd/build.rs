//! Build command implementation.
//!
//! Loads the configuration, builds every selected revision (or only the local
//! working tree) and prints a summary.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use polyversion_lib::RunReport;
use polyversion_lib::config::Config;

use crate::output::{format_duration, print_error, print_json, print_stat, print_success, print_warning};

#[derive(Debug)]
pub struct BuildOptions {
  pub conf: PathBuf,
  pub out: Option<PathBuf>,
  pub overrides: Vec<(String, String)>,
  pub local: bool,
  pub sequential: bool,
  pub json: bool,
}

pub async fn cmd_build(options: BuildOptions) -> Result<()> {
  if !options.conf.is_file() {
    print_error(&format!("Config file doesn't exist: {}", options.conf.display()));
    std::process::exit(1);
  }

  let mut overrides = options.overrides;
  if options.sequential {
    overrides.push(("sequential".to_string(), "true".to_string()));
  }

  let conf = dunce::canonicalize(&options.conf)
    .with_context(|| format!("Failed to resolve {}", options.conf.display()))?;
  let mut config =
    Config::load(&conf, &overrides).with_context(|| format!("Failed to load config {}", conf.display()))?;
  if let Some(out) = &options.out {
    config.output_dir = std::path::absolute(out).with_context(|| format!("Invalid output directory {}", out.display()))?;
  }

  let config_dir = conf.parent().unwrap_or(Path::new("."));
  let root = config.resolve_root(config_dir).await;
  let driver = config.to_driver(&root).context("Invalid configuration")?;
  debug!(config = ?conf, root = ?root, local = options.local, "starting build");

  let started = Instant::now();
  let report = if options.local {
    let mock = config
      .mock_data()?
      .context("Local builds need a [mock] section in the config")?;
    driver.run_local(mock).await.context("Local build failed")?
  } else {
    driver.run().await.context("Build failed")?
  };

  if options.json {
    print_json(&summary_json(&report, driver.output_dir()))?;
  } else {
    print_summary(&report, driver.output_dir(), started.elapsed());
  }
  Ok(())
}

fn print_summary(report: &RunReport, output_dir: &Path, elapsed: std::time::Duration) {
  print_success(&format!(
    "Built {} of {} revision(s)",
    report.builds.len(),
    report.targets.len()
  ));
  print_stat("Output", &output_dir.display().to_string());
  print_stat("Duration", &format_duration(elapsed));

  if !report.is_success() {
    println!();
    print_warning(&format!("{} revision(s) failed:", report.failures.len()));
    for failure in &report.failures {
      print_stat(&failure.revision.name, &failure.error.to_string());
    }
  }
}

fn summary_json(report: &RunReport, output_dir: &Path) -> serde_json::Value {
  let failures: Vec<_> = report
    .failures
    .iter()
    .map(|f| serde_json::json!({ "revision": f.revision.name, "error": f.error.to_string() }))
    .collect();
  serde_json::json!({
    "output_dir": output_dir,
    "targets": report.targets.iter().map(|r| &r.name).collect::<Vec<_>>(),
    "builds": report.build_names(),
    "failures": failures,
  })
}
