//! Builders that run an external command.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{BuildError, Builder};
use crate::codec::{Codec, Value};
use crate::environment::{Environment, ExecContext};

/// Variable carrying the encoded metadata into the build process.
pub const DATA_ENV_VAR: &str = "POLYVERSION_DATA";

/// One command-line argument, possibly a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
  Literal(String),
  /// The documentation source directory inside the checkout.
  SourceDir,
  /// The output directory of this revision.
  OutputDir,
}

impl Arg {
  /// Parse `{SOURCE_DIR}` and `{OUTPUT_DIR}`; anything else is literal.
  pub fn parse(text: &str) -> Self {
    match text {
      "{SOURCE_DIR}" => Arg::SourceDir,
      "{OUTPUT_DIR}" => Arg::OutputDir,
      other => Arg::Literal(other.to_string()),
    }
  }

  fn resolve(&self, source_dir: &Path, output_dir: &Path) -> String {
    match self {
      Arg::Literal(s) => s.clone(),
      Arg::SourceDir => source_dir.to_string_lossy().into_owned(),
      Arg::OutputDir => output_dir.to_string_lossy().into_owned(),
    }
  }
}

impl From<&str> for Arg {
  fn from(text: &str) -> Self {
    Arg::parse(text)
  }
}

impl From<String> for Arg {
  fn from(text: String) -> Self {
    Arg::parse(&text)
  }
}

impl fmt::Display for Arg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Arg::Literal(s) => f.write_str(s),
      Arg::SourceDir => f.write_str("{SOURCE_DIR}"),
      Arg::OutputDir => f.write_str("{OUTPUT_DIR}"),
    }
  }
}

/// Runs a command (plus optional pre and post commands) inside the environment.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
  source: PathBuf,
  cmd: Vec<Arg>,
  pre_cmd: Option<Vec<Arg>>,
  post_cmd: Option<Vec<Arg>>,
  codec: Codec,
}

impl CommandBuilder {
  /// `source` is the documentation directory relative to the checkout.
  pub fn new<I, A>(source: impl Into<PathBuf>, cmd: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
  {
    Self {
      source: source.into(),
      cmd: cmd.into_iter().map(Into::into).collect(),
      pre_cmd: None,
      post_cmd: None,
      codec: Codec::global().clone(),
    }
  }

  pub fn with_pre_cmd<I, A>(mut self, cmd: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
  {
    self.pre_cmd = Some(cmd.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_post_cmd<I, A>(mut self, cmd: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
  {
    self.post_cmd = Some(cmd.into_iter().map(Into::into).collect());
    self
  }

  /// Encode metadata with `codec` instead of the global codec.
  pub fn with_codec(mut self, codec: Codec) -> Self {
    self.codec = codec;
    self
  }

  /// The sphinx preset: `sphinx-build --color <args> {SOURCE_DIR} {OUTPUT_DIR}`.
  pub fn sphinx<I, S>(source: impl Into<PathBuf>, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut cmd = vec![Arg::parse("sphinx-build"), Arg::parse("--color")];
    cmd.extend(args.into_iter().map(|a| Arg::Literal(a.into())));
    cmd.push(Arg::SourceDir);
    cmd.push(Arg::OutputDir);
    Self::new(source, cmd)
  }

  pub fn command(&self) -> &[Arg] {
    &self.cmd
  }

  async fn run_step(
    &self,
    environment: &dyn Environment,
    step: &[Arg],
    source_dir: &Path,
    output_dir: &Path,
    ctx: &ExecContext,
  ) -> Result<(), BuildError> {
    let cmd: Vec<String> = step.iter().map(|a| a.resolve(source_dir, output_dir)).collect();
    let out = environment.execute(&cmd, ctx.clone()).await?;
    if !out.stdout.is_empty() {
      debug!(stdout = %out.stdout.trim_end(), "build output");
    }
    if !out.success() {
      return Err(BuildError::command_failed(&cmd, out));
    }
    Ok(())
  }
}

#[async_trait]
impl Builder for CommandBuilder {
  async fn build(&self, environment: &dyn Environment, output_dir: &Path, data: &Value) -> Result<Value, BuildError> {
    // relative to the caller, not the checkout
    let output_dir = std::path::absolute(output_dir)?;
    let output_dir = output_dir.as_path();
    info!(env = %environment.name(), output = ?output_dir, "building");

    let source_dir = environment.path().join(&self.source);
    let ctx = ExecContext::new()
      .with_cwd(environment.path())
      .with_env(DATA_ENV_VAR, self.codec.encode(data)?);

    tokio::fs::create_dir_all(output_dir).await?;

    if let Some(pre) = &self.pre_cmd {
      self.run_step(environment, pre, &source_dir, output_dir, &ctx).await?;
    }
    self.run_step(environment, &self.cmd, &source_dir, output_dir, &ctx).await?;
    if let Some(post) = &self.post_cmd {
      self.run_step(environment, post, &source_dir, output_dir, &ctx).await?;
    }

    Ok(Value::Null)
  }
}
