//! Builders turn a provisioned environment into documentation output.

mod command;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{CodecError, Value};
use crate::environment::{CommandOutput, EnvState, Environment};

pub use command::{Arg, CommandBuilder, DATA_ENV_VAR};

/// Errors raised while provisioning an environment or running a build.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A command exited with a nonzero status (or was killed by a signal).
  #[error("command failed with exit code {code:?}: {cmd}")]
  CommandFailed {
    cmd: String,
    code: Option<i32>,
    stdout: String,
    stderr: String,
  },

  /// A command could not be started.
  #[error("failed to spawn {cmd}: {source}")]
  Spawn {
    cmd: String,
    #[source]
    source: std::io::Error,
  },

  /// A command exceeded its time limit and was killed.
  #[error("command timed out after {after:?}: {cmd}")]
  Timeout { cmd: String, after: Duration },

  /// An empty argument list was passed as a command.
  #[error("empty command")]
  EmptyCommand,

  /// A lifecycle operation was called in the wrong state.
  #[error("environment '{name}' is {actual}, expected {expected}")]
  InvalidState {
    name: String,
    actual: EnvState,
    expected: EnvState,
  },

  /// The metadata could not be encoded.
  #[error("codec error: {0}")]
  Codec(#[from] CodecError),

  /// I/O error while preparing the build.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BuildError {
  /// Build a [`BuildError::CommandFailed`] from a finished command.
  pub fn command_failed(cmd: &[String], output: CommandOutput) -> Self {
    BuildError::CommandFailed {
      cmd: cmd.join(" "),
      code: output.code,
      stdout: output.stdout,
      stderr: output.stderr,
    }
  }

  /// Exit code of the failed command, if any.
  pub fn code(&self) -> Option<i32> {
    match self {
      BuildError::CommandFailed { code, .. } => *code,
      _ => None,
    }
  }
}

/// Produces the build output for one revision.
#[async_trait]
pub trait Builder: Send + Sync {
  /// Build into `output_dir` using the entered `environment`.
  ///
  /// Must create `output_dir`, expose `data` to the invoked process and report
  /// any nonzero exit as an error. The returned artifact may be `Value::Null`.
  async fn build(&self, environment: &dyn Environment, output_dir: &Path, data: &Value) -> Result<Value, BuildError>;
}
