//! Python virtual environments.
//!
//! [`VirtualPythonEnvironment`] activates a virtual environment for every
//! command it runs. On entry it can create the environment (`python3 -m venv`
//! or `virtualenv`) and install the checkout's dependencies with pip or poetry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{CommandOutput, EnvCore, EnvState, Environment, EnvironmentFactory, ExecContext, run_process};
use crate::builder::BuildError;

/// How the virtual environment is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenvCreator {
  /// `python3 -m venv <args> <path>`
  Venv { args: Vec<String> },
  /// `virtualenv <args> <path>`
  Virtualenv { args: Vec<String> },
}

impl VenvCreator {
  fn command(&self, venv: &Path) -> Vec<String> {
    let (mut cmd, args) = match self {
      VenvCreator::Venv { args } => (vec!["python3".to_string(), "-m".to_string(), "venv".to_string()], args),
      VenvCreator::Virtualenv { args } => (vec!["virtualenv".to_string()], args),
    };
    cmd.extend(args.iter().cloned());
    cmd.push(venv.to_string_lossy().into_owned());
    cmd
  }
}

/// How dependencies are installed into the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Installer {
  #[default]
  None,
  /// `pip install <args>` inside the activated environment.
  Pip { args: Vec<String> },
  /// `poetry install <args>`; poetry decides where the environment lives.
  Poetry { args: Vec<String> },
}

/// An environment running commands inside a Python virtual environment.
#[derive(Debug, Clone)]
pub struct VirtualPythonEnvironment {
  core: EnvCore,
  venv: PathBuf,
  creator: Option<VenvCreator>,
  installer: Installer,
}

impl VirtualPythonEnvironment {
  /// Use the virtual environment at `venv`; relative paths are resolved
  /// against the checkout.
  pub fn new(path: &Path, name: &str, venv: impl AsRef<Path>) -> Self {
    let core = EnvCore::new(path, name);
    let venv = core.path().join(venv.as_ref());
    Self {
      core,
      venv,
      creator: None,
      installer: Installer::None,
    }
  }

  /// A poetry-managed environment for the checkout at `path`.
  pub fn poetry(path: &Path, name: &str, args: Vec<String>) -> Self {
    Self::new(path, name, ".venv").with_installer(Installer::Poetry { args })
  }

  /// A pip-provisioned environment at `venv`.
  pub fn pip(path: &Path, name: &str, venv: impl AsRef<Path>, args: Vec<String>) -> Self {
    Self::new(path, name, venv).with_installer(Installer::Pip { args })
  }

  pub fn with_creator(mut self, creator: VenvCreator) -> Self {
    self.creator = Some(creator);
    self
  }

  pub fn with_installer(mut self, installer: Installer) -> Self {
    self.installer = installer;
    self
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

  /// Location of the virtual environment.
  pub fn venv(&self) -> &Path {
    &self.venv
  }

  /// A factory producing environments with the same settings.
  pub fn factory(venv: PathBuf, creator: Option<VenvCreator>, installer: Installer) -> EnvironmentFactory {
    Arc::new(move |path: &Path, name: &str| -> Box<dyn Environment> {
      let mut env = VirtualPythonEnvironment::new(path, name, &venv).with_installer(installer.clone());
      env.creator = creator.clone();
      Box::new(env)
    })
  }

  fn bin_dir(&self) -> PathBuf {
    self.venv.join("bin")
  }

  /// Run a provisioning step, turning a nonzero exit into an error.
  async fn provision(&self, cmd: &[String], ctx: ExecContext) -> Result<CommandOutput, BuildError> {
    info!(env = %self.core.name(), cmd = %cmd.join(" "), "provisioning");
    let ctx = self.core.prepare(ctx);
    let out = run_process(cmd, &ctx).await?;
    debug!(stdout = %out.stdout.trim_end(), "provisioning output");
    if !out.success() {
      error!(env = %self.core.name(), stderr = %out.stderr.trim_end(), "provisioning failed");
      return Err(BuildError::command_failed(cmd, out));
    }
    Ok(out)
  }

  async fn create_venv(&self) -> Result<(), BuildError> {
    if let Some(creator) = &self.creator {
      info!(venv = ?self.venv, "creating virtual environment");
      self.provision(&creator.command(&self.venv), ExecContext::new()).await?;
    }
    Ok(())
  }

  async fn pip_install(&self, args: &[String]) -> Result<(), BuildError> {
    let mut cmd = vec!["pip".to_string(), "install".to_string()];
    cmd.extend(args.iter().cloned());
    let mut ctx = ExecContext::new();
    self.activate(&mut ctx);
    self.provision(&cmd, ctx).await.map(|_| ())
  }

  /// `poetry install`, then ask poetry where it put the environment.
  async fn poetry_install(&mut self, args: &[String]) -> Result<(), BuildError> {
    let venvs = unused_dir(self.core.path(), ".venv");

    let mut ctx = ExecContext::new();
    ctx.unset("VIRTUAL_ENV");
    ctx.set("POETRY_VIRTUALENVS_IN_PROJECT", "False");
    ctx.set("POETRY_VIRTUALENVS_PATH", venvs.to_string_lossy());

    let mut cmd = vec!["poetry".to_string(), "install".to_string()];
    cmd.extend(args.iter().cloned());
    self.provision(&cmd, ctx.clone()).await?;

    let info = ["poetry", "env", "info", "--path"].map(String::from);
    let out = self.provision(&info, ctx).await?;
    self.venv = PathBuf::from(out.stdout.trim_end_matches(['\n', '\r']));
    debug!(venv = ?self.venv, "poetry environment located");
    Ok(())
  }
}

/// `<dir>/<base>`, or `<dir>/<base>-N` for the first N that does not exist.
fn unused_dir(dir: &Path, base: &str) -> PathBuf {
  let mut candidate = dir.join(base);
  let mut i = 0;
  while candidate.exists() {
    candidate = dir.join(format!("{}-{}", base, i));
    i += 1;
  }
  candidate
}

#[async_trait]
impl Environment for VirtualPythonEnvironment {
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
    self.core.begin_enter()?;
    self.create_venv().await?;
    match self.installer.clone() {
      Installer::None => {}
      Installer::Pip { args } => self.pip_install(&args).await?,
      Installer::Poetry { args } => self.poetry_install(&args).await?,
    }
    Ok(())
  }

  async fn exit(&mut self) -> Result<(), BuildError> {
    self.core.finish_exit();
    Ok(())
  }

  fn activate(&self, ctx: &mut ExecContext) {
    ctx.set("VIRTUAL_ENV", self.venv.to_string_lossy());
    let mut paths = vec![self.bin_dir()];
    if let Some(current) = ctx.var("PATH") {
      paths.extend(std::env::split_paths(&current));
    }
    match std::env::join_paths(paths) {
      Ok(joined) => ctx.set("PATH", joined.to_string_lossy()),
      Err(_) => ctx.set("PATH", self.bin_dir().to_string_lossy()),
    }
  }

  async fn execute(&self, cmd: &[String], ctx: ExecContext) -> Result<CommandOutput, BuildError> {
    self.core.require_entered()?;
    let mut ctx = self.core.prepare(ctx);
    self.activate(&mut ctx);
    run_process(cmd, &ctx).await
  }
}
