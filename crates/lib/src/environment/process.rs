//! Child process execution.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, ExecContext};
use crate::builder::BuildError;

/// Run `cmd` with `ctx` applied and capture its output.
///
/// A nonzero exit is returned in [`CommandOutput::code`]. Exceeding the
/// context's timeout kills the child and yields [`BuildError::Timeout`].
pub async fn run_process(cmd: &[String], ctx: &ExecContext) -> Result<CommandOutput, BuildError> {
  let (program, args) = cmd.split_first().ok_or(BuildError::EmptyCommand)?;
  let line = cmd.join(" ");

  let mut command = Command::new(program);
  command
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  if !ctx.inherit {
    command.env_clear();
  }
  for key in &ctx.remove {
    command.env_remove(key);
  }
  command.envs(&ctx.env);
  if let Some(cwd) = &ctx.cwd {
    command.current_dir(cwd);
  }

  debug!(cmd = %line, cwd = ?ctx.cwd, "spawning process");

  let child = command.spawn().map_err(|source| BuildError::Spawn {
    cmd: line.clone(),
    source,
  })?;

  let output = match ctx.timeout {
    Some(after) => tokio::time::timeout(after, child.wait_with_output())
      .await
      .map_err(|_| BuildError::Timeout { cmd: line.clone(), after })??,
    None => child.wait_with_output().await?,
  };

  let result = CommandOutput {
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    code: output.status.code(),
  };

  debug!(cmd = %line, code = ?result.code, "process finished");
  if !result.success() && !result.stderr.is_empty() {
    debug!(stderr = %result.stderr.trim_end(), "command stderr");
  }

  Ok(result)
}
