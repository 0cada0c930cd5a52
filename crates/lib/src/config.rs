//! Declarative run configuration.
//!
//! A run is described by a TOML file:
//!
//! ```toml
//! output_dir = "build/docs"
//! template_dir = "docs/templates"
//! sort_builds = true
//!
//! [git]
//! branch_regex = "main|dev"
//! tag_regex = "v\\d+\\.\\d+"
//!
//! [environment]
//! kind = "poetry"
//! args = ["--only", "docs"]
//! setuptools_scm = true
//!
//! [builder]
//! kind = "sphinx"
//! source = "docs"
//! ```
//!
//! `key=value` overrides address dotted keys (`git.remote=origin`) and are
//! applied to the parsed table before it is deserialized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::builder::{Builder, CommandBuilder};
use crate::driver::{Driver, MockData};
use crate::environment::scm::pretend_version_env;
use crate::environment::{Environment, EnvironmentFactory, PlainEnvironment, VenvCreator, VirtualPythonEnvironment};
use crate::provider::{FilePredicate, GitProvider, RefFilter};
use crate::revision::{Revision, RevisionKind};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid configuration: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("failed to apply overrides: {0}")]
  Serialize(#[from] toml::ser::Error),

  #[error("invalid override '{0}': {1}")]
  InvalidOverride(String, &'static str),

  #[error("invalid ref pattern: {0}")]
  Regex(#[from] regex::Error),

  #[error("invalid revision kind '{0}'")]
  InvalidKind(String),

  #[error("invalid timestamp '{value}': {source}")]
  InvalidTimestamp {
    value: String,
    #[source]
    source: chrono::ParseError,
  },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default = "default_output_dir")]
  pub output_dir: PathBuf,
  pub static_dir: Option<PathBuf>,
  pub template_dir: Option<PathBuf>,
  /// Maximum number of concurrent builds; unbounded when unset.
  pub parallelism: Option<usize>,
  /// Build one revision at a time.
  #[serde(default)]
  pub sequential: bool,
  /// Order the manifest by revision creation time.
  #[serde(default)]
  pub sort_builds: bool,
  /// Repository root; defaults to the repository containing the config file.
  pub root: Option<PathBuf>,
  #[serde(default)]
  pub git: GitConfig,
  #[serde(default)]
  pub environment: EnvironmentConfig,
  #[serde(default)]
  pub builder: BuilderConfig,
  pub mock: Option<MockConfig>,
}

fn default_output_dir() -> PathBuf {
  PathBuf::from("docs/build")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GitConfig {
  pub branch_regex: String,
  pub tag_regex: String,
  /// Only build remote-tracking branches of this remote.
  pub remote: Option<String>,
  /// Paths that must exist in a revision for it to be built.
  pub require_files: Vec<PathBuf>,
  /// Remote to fetch missing submodule commits from.
  pub fetch_remote: Option<String>,
}

impl Default for GitConfig {
  fn default() -> Self {
    Self {
      branch_regex: ".*".to_string(),
      tag_regex: ".*".to_string(),
      remote: None,
      require_files: Vec::new(),
      fetch_remote: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
  #[default]
  Plain,
  Venv,
  Pip,
  Poetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatorKind {
  Venv,
  Virtualenv,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnvironmentConfig {
  pub kind: EnvironmentKind,
  /// Virtual environment location, relative to the checkout.
  pub venv: PathBuf,
  pub creator: Option<CreatorKind>,
  pub creator_args: Vec<String>,
  /// Arguments for `pip install` or `poetry install`.
  pub args: Vec<String>,
  /// Extra variables for every command.
  pub env: BTreeMap<String, String>,
  pub timeout_secs: Option<u64>,
  /// Export the revision's version for setuptools-scm.
  pub setuptools_scm: bool,
  pub package_name: Option<String>,
}

impl Default for EnvironmentConfig {
  fn default() -> Self {
    Self {
      kind: EnvironmentKind::Plain,
      venv: PathBuf::from(".venv"),
      creator: None,
      creator_args: Vec::new(),
      args: Vec::new(),
      env: BTreeMap::new(),
      timeout_secs: None,
      setuptools_scm: false,
      package_name: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderKind {
  #[default]
  Sphinx,
  Command,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuilderConfig {
  pub kind: BuilderKind,
  /// Documentation directory relative to the checkout.
  pub source: PathBuf,
  /// Extra `sphinx-build` arguments.
  pub args: Vec<String>,
  /// Command line of the `command` builder.
  pub cmd: Vec<String>,
  pub pre_cmd: Vec<String>,
  pub post_cmd: Vec<String>,
}

impl Default for BuilderConfig {
  fn default() -> Self {
    Self {
      kind: BuilderKind::Sphinx,
      source: PathBuf::from("docs"),
      args: Vec::new(),
      cmd: Vec::new(),
      pre_cmd: Vec::new(),
      post_cmd: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
  pub current: MockRevision,
  #[serde(default)]
  pub revisions: Vec<MockRevision>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockRevision {
  pub name: String,
  #[serde(default = "default_mock_kind")]
  pub kind: String,
  #[serde(default)]
  pub content_id: String,
  #[serde(default)]
  pub origin_ref: String,
  /// RFC 3339 timestamp.
  pub created_at: Option<String>,
}

fn default_mock_kind() -> String {
  "branch".to_string()
}

impl MockRevision {
  fn to_revision(&self) -> Result<Revision, ConfigError> {
    let kind = RevisionKind::parse(&self.kind).ok_or_else(|| ConfigError::InvalidKind(self.kind.clone()))?;
    let raw = self.created_at.as_deref().unwrap_or("1970-01-01T00:00:00+00:00");
    let created_at: DateTime<FixedOffset> =
      DateTime::parse_from_rfc3339(raw).map_err(|source| ConfigError::InvalidTimestamp {
        value: raw.to_string(),
        source,
      })?;
    Ok(Revision::new(
      &self.name,
      &self.content_id,
      &self.origin_ref,
      kind,
      created_at,
    ))
  }
}

/// Split a `key=value` override at the first `=`.
pub fn parse_override(text: &str) -> Result<(String, String), ConfigError> {
  let (key, value) = text
    .split_once('=')
    .ok_or_else(|| ConfigError::InvalidOverride(text.to_string(), "not a key=value pair"))?;
  let key = key.trim();
  if key.is_empty() {
    return Err(ConfigError::InvalidOverride(text.to_string(), "empty key"));
  }
  Ok((key.to_string(), value.to_string()))
}

/// Parse an override value as a TOML literal, falling back to a string.
fn override_value(raw: &str) -> toml::Value {
  toml::from_str::<toml::Table>(&format!("value = {raw}"))
    .ok()
    .and_then(|mut table| table.remove("value"))
    .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Set the dotted `key` in `table`, creating intermediate tables.
pub fn apply_override(table: &mut toml::Table, key: &str, raw: &str) -> Result<(), ConfigError> {
  let invalid = |reason| ConfigError::InvalidOverride(format!("{key}={raw}"), reason);

  let mut parts: Vec<&str> = key.split('.').map(str::trim).collect();
  let last = parts.pop().filter(|p| !p.is_empty()).ok_or_else(|| invalid("empty key"))?;

  let mut current = table;
  for part in parts {
    if part.is_empty() {
      return Err(invalid("empty key segment"));
    }
    let entry = current
      .entry(part.to_string())
      .or_insert(toml::Value::Table(toml::Table::new()));
    current = match entry {
      toml::Value::Table(t) => t,
      _ => return Err(invalid("not a table")),
    };
  }

  current.insert(last.to_string(), override_value(raw));
  Ok(())
}

impl Config {
  /// Parse `text` with `overrides` applied.
  pub fn parse(text: &str, overrides: &[(String, String)]) -> Result<Self, ConfigError> {
    let mut table: toml::Table = toml::from_str(text)?;
    for (key, value) in overrides {
      debug!(key = %key, value = %value, "applying override");
      apply_override(&mut table, key, value)?;
    }
    let merged = toml::to_string(&table)?;
    Ok(toml::from_str(&merged)?)
  }

  /// Read and parse the file at `path`.
  pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&text, overrides)
  }

  /// The repository root: `root` relative to `config_dir`, or the top-level of
  /// the repository containing `config_dir`.
  pub async fn resolve_root(&self, config_dir: &Path) -> PathBuf {
    if let Some(root) = &self.root {
      return config_dir.join(root);
    }
    match GitProvider::root(config_dir).await {
      Ok(root) => root,
      Err(e) => {
        warn!(dir = ?config_dir, error = %e, "not inside a git repository, using the config directory as root");
        config_dir.to_path_buf()
      }
    }
  }

  /// Concurrent build limit after applying `sequential`.
  pub fn effective_parallelism(&self) -> Option<usize> {
    if self.sequential { Some(1) } else { self.parallelism }
  }

  pub fn ref_filter(&self) -> Result<RefFilter, ConfigError> {
    let mut filter = RefFilter::new(&self.git.branch_regex, &self.git.tag_regex)?;
    if let Some(remote) = &self.git.remote {
      filter = filter.with_remote(remote);
    }
    if !self.git.require_files.is_empty() {
      filter = filter.with_predicate(FilePredicate::new(self.git.require_files.clone()));
    }
    Ok(filter)
  }

  pub fn provider(&self) -> Result<GitProvider, ConfigError> {
    let mut provider = GitProvider::new(self.ref_filter()?);
    if let Some(remote) = &self.git.fetch_remote {
      provider = provider.with_fetch_remote(remote);
    }
    Ok(provider)
  }

  pub fn builder(&self) -> CommandBuilder {
    let cfg = &self.builder;
    let builder = match cfg.kind {
      BuilderKind::Sphinx => CommandBuilder::sphinx(&cfg.source, cfg.args.clone()),
      BuilderKind::Command => CommandBuilder::new(&cfg.source, cfg.cmd.iter().map(String::as_str)),
    };
    let builder = if cfg.pre_cmd.is_empty() {
      builder
    } else {
      builder.with_pre_cmd(cfg.pre_cmd.iter().map(String::as_str))
    };
    if cfg.post_cmd.is_empty() {
      builder
    } else {
      builder.with_post_cmd(cfg.post_cmd.iter().map(String::as_str))
    }
  }

  pub fn environment_factory(&self) -> EnvironmentFactory {
    let cfg = self.environment.clone();
    Arc::new(move |path: &Path, name: &str| -> Box<dyn Environment> {
      let timeout = cfg.timeout_secs.map(Duration::from_secs);
      let mut vars = cfg.env.clone();
      if cfg.setuptools_scm {
        for (key, value) in pretend_version_env(name, cfg.package_name.as_deref()) {
          vars.entry(key).or_insert(value);
        }
      }
      let creator = cfg.creator.map(|kind| match kind {
        CreatorKind::Venv => VenvCreator::Venv {
          args: cfg.creator_args.clone(),
        },
        CreatorKind::Virtualenv => VenvCreator::Virtualenv {
          args: cfg.creator_args.clone(),
        },
      });

      let python = match cfg.kind {
        EnvironmentKind::Plain => {
          let mut env = PlainEnvironment::new(path, name).with_timeout(timeout);
          env.core_mut().default_vars(vars);
          return Box::new(env);
        }
        EnvironmentKind::Venv => VirtualPythonEnvironment::new(path, name, &cfg.venv),
        EnvironmentKind::Pip => VirtualPythonEnvironment::pip(path, name, &cfg.venv, cfg.args.clone()),
        EnvironmentKind::Poetry => VirtualPythonEnvironment::poetry(path, name, cfg.args.clone()),
      };
      let mut env = python.with_timeout(timeout);
      if let Some(creator) = creator {
        env = env.with_creator(creator);
      }
      env.core_mut().default_vars(vars);
      Box::new(env)
    })
  }

  /// Mock data for local runs, if configured.
  pub fn mock_data(&self) -> Result<Option<MockData>, ConfigError> {
    let Some(mock) = &self.mock else {
      return Ok(None);
    };
    Ok(Some(MockData {
      current: mock.current.to_revision()?,
      revisions: mock
        .revisions
        .iter()
        .map(MockRevision::to_revision)
        .collect::<Result<_, _>>()?,
    }))
  }

  /// Assemble a driver for the repository at `root`. Relative directories are
  /// resolved against `root`.
  pub fn to_driver(&self, root: &Path) -> Result<Driver, ConfigError> {
    let builder: Arc<dyn Builder> = Arc::new(self.builder());
    let mut driver = Driver::new(
      root,
      root.join(&self.output_dir),
      Arc::new(self.provider()?),
      builder,
      self.environment_factory(),
    )
    .with_parallelism(self.effective_parallelism())
    .with_sorted_builds(self.sort_builds);

    if let Some(dir) = &self.static_dir {
      driver = driver.with_static_dir(root.join(dir));
    }
    if let Some(dir) = &self.template_dir {
      driver = driver.with_template_dir(root.join(dir));
    }
    Ok(driver)
  }
}
