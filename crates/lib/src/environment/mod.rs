//! Build environments.
//!
//! An [`Environment`] is the scoped context a build runs in. It is entered
//! once before the builder is invoked and exited once afterwards:
//!
//! ```text
//! Created --enter--> Entered --exit--> Exited
//! ```
//!
//! Commands run through [`Environment::execute`], which applies the
//! environment's activation (extra variables, `PATH` changes) to the
//! caller's [`ExecContext`].

mod process;
pub mod scm;
pub mod venv;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::builder::BuildError;

pub use process::run_process;
pub use venv::{Installer, VenvCreator, VirtualPythonEnvironment};

/// Creates an environment for a checkout directory and a revision name.
pub type EnvironmentFactory = Arc<dyn Fn(&Path, &str) -> Box<dyn Environment> + Send + Sync>;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  pub stdout: String,
  pub stderr: String,
  /// Exit code, `None` when the process was terminated by a signal.
  pub code: Option<i32>,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }
}

/// How a command is launched: variables, working directory and time limit.
#[derive(Debug, Clone)]
pub struct ExecContext {
  /// Variables set for the child process.
  pub env: BTreeMap<String, String>,
  /// Variables removed from the inherited environment.
  pub remove: Vec<String>,
  /// Whether the child inherits this process's environment.
  pub inherit: bool,
  pub cwd: Option<PathBuf>,
  pub timeout: Option<Duration>,
}

impl Default for ExecContext {
  fn default() -> Self {
    Self {
      env: BTreeMap::new(),
      remove: Vec::new(),
      inherit: true,
      cwd: None,
      timeout: None,
    }
  }
}

impl ExecContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.set(key, value);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    self.remove.retain(|k| *k != key);
    self.env.insert(key, value.into());
  }

  /// Set `key` unless the context already defines it.
  pub fn set_default(&mut self, key: &str, value: &str) {
    if !self.env.contains_key(key) {
      self.set(key, value);
    }
  }

  pub fn unset(&mut self, key: &str) {
    self.env.remove(key);
    if !self.remove.iter().any(|k| k == key) {
      self.remove.push(key.to_string());
    }
  }

  /// The value `key` will have in the child process.
  pub fn var(&self, key: &str) -> Option<String> {
    if let Some(value) = self.env.get(key) {
      return Some(value.clone());
    }
    if !self.inherit || self.remove.iter().any(|k| k == key) {
      return None;
    }
    std::env::var(key).ok()
  }
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
  Created,
  Entered,
  Exited,
}

impl fmt::Display for EnvState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      EnvState::Created => "created",
      EnvState::Entered => "entered",
      EnvState::Exited => "exited",
    };
    f.write_str(s)
  }
}

/// A scoped command-execution context.
#[async_trait]
pub trait Environment: Send + Sync {
  /// Location of the checkout this environment builds.
  fn path(&self) -> &Path;

  /// Display name, usually the revision name.
  fn name(&self) -> &str;

  fn state(&self) -> EnvState;

  /// Provision the environment. Called exactly once.
  async fn enter(&mut self) -> Result<(), BuildError>;

  /// Release everything acquired by [`enter`](Self::enter), even when it failed.
  async fn exit(&mut self) -> Result<(), BuildError>;

  /// Apply this environment's activation to a context.
  fn activate(&self, ctx: &mut ExecContext);

  /// Run a command. A nonzero exit is reported in the output, not as an error.
  async fn execute(&self, cmd: &[String], ctx: ExecContext) -> Result<CommandOutput, BuildError>;
}

/// State and settings shared by the environment implementations.
#[derive(Debug, Clone)]
pub struct EnvCore {
  path: PathBuf,
  name: String,
  state: EnvState,
  vars: BTreeMap<String, String>,
  timeout: Option<Duration>,
}

impl EnvCore {
  pub fn new(path: &Path, name: &str) -> Self {
    Self {
      path: std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
      name: name.to_string(),
      state: EnvState::Created,
      vars: BTreeMap::new(),
      timeout: None,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> EnvState {
    self.state
  }

  pub fn vars(&self) -> &BTreeMap<String, String> {
    &self.vars
  }

  pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.vars.insert(key.into(), value.into());
  }

  /// Insert variables that are not set yet.
  pub fn default_vars(&mut self, vars: BTreeMap<String, String>) {
    for (key, value) in vars {
      self.vars.entry(key).or_insert(value);
    }
  }

  pub fn set_timeout(&mut self, timeout: Option<Duration>) {
    self.timeout = timeout;
  }

  fn expect(&self, expected: EnvState) -> Result<(), BuildError> {
    if self.state == expected {
      return Ok(());
    }
    Err(BuildError::InvalidState {
      name: self.name.clone(),
      actual: self.state,
      expected,
    })
  }

  /// Move from `Created` to `Entered`.
  ///
  /// The state changes before provisioning runs so that a failed provisioning
  /// can still be exited.
  pub fn begin_enter(&mut self) -> Result<(), BuildError> {
    self.expect(EnvState::Created)?;
    self.state = EnvState::Entered;
    debug!(env = %self.name, "entered environment");
    Ok(())
  }

  /// Move to `Exited`. Exiting twice is a no-op.
  pub fn finish_exit(&mut self) {
    if self.state != EnvState::Exited {
      self.state = EnvState::Exited;
      debug!(env = %self.name, "exited environment");
    }
  }

  pub fn require_entered(&self) -> Result<(), BuildError> {
    self.expect(EnvState::Entered)
  }

  /// Complete a caller context with the instance variables, working directory
  /// and timeout. Values set by the caller win.
  pub fn prepare(&self, mut ctx: ExecContext) -> ExecContext {
    for (key, value) in &self.vars {
      ctx.set_default(key, value);
    }
    if ctx.cwd.is_none() {
      ctx.cwd = Some(self.path.clone());
    }
    if ctx.timeout.is_none() {
      ctx.timeout = self.timeout;
    }
    ctx
  }
}

/// Runs commands without any provisioning.
#[derive(Debug, Clone)]
pub struct PlainEnvironment {
  core: EnvCore,
}

impl PlainEnvironment {
  pub fn new(path: &Path, name: &str) -> Self {
    Self {
      core: EnvCore::new(path, name),
    }
  }

  pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.core.set_var(key, value);
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.core.set_timeout(timeout);
    self
  }

  pub fn core_mut(&mut self) -> &mut EnvCore {
    &mut self.core
  }

  /// A factory producing plain environments.
  pub fn factory() -> EnvironmentFactory {
    Arc::new(|path: &Path, name: &str| -> Box<dyn Environment> { Box::new(PlainEnvironment::new(path, name)) })
  }
}

#[async_trait]
impl Environment for PlainEnvironment {
  fn path(&self) -> &Path {
    self.core.path()
  }

  fn name(&self) -> &str {
    self.core.name()
  }

  fn state(&self) -> EnvState {
    self.core.state()
  }

  async fn enter(&mut self) -> Result<(), BuildError> {
    self.core.begin_enter()
  }

  async fn exit(&mut self) -> Result<(), BuildError> {
    self.core.finish_exit();
    Ok(())
  }

  fn activate(&self, _ctx: &mut ExecContext) {}

  async fn execute(&self, cmd: &[String], ctx: ExecContext) -> Result<CommandOutput, BuildError> {
    self.core.require_entered()?;
    let mut ctx = self.core.prepare(ctx);
    self.activate(&mut ctx);
    run_process(cmd, &ctx).await
  }
}
