//! Copying the working tree for local builds.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{info, warn};

use crate::provider::git::git_command;
use crate::util::fs::{copy_dir_all_async, copy_listed_async};

/// Copy the files of the working tree at `root` into `dest`.
///
/// Only files git does not ignore are copied. When git cannot list them the
/// whole directory is copied instead, ignored files included.
pub async fn copy_working_tree(root: &Path, dest: &Path) -> io::Result<u64> {
  match unignored_files(root).await {
    Ok(files) => {
      info!(files = files.len(), "copying working tree");
      copy_listed_async(root.to_path_buf(), dest.to_path_buf(), files).await
    }
    Err(reason) => {
      warn!(root = ?root, reason = %reason, "could not list unignored files, copying the whole working tree");
      copy_dir_all_async(root.to_path_buf(), dest.to_path_buf()).await
    }
  }
}

/// Tracked and untracked-but-not-ignored files, relative to `root`.
async fn unignored_files(root: &Path) -> Result<Vec<PathBuf>, String> {
  let output = git_command(root)
    .args(["ls-files", "--cached", "--others", "--exclude-standard", "-z"])
    .stdin(Stdio::null())
    .output()
    .await
    .map_err(|e| e.to_string())?;

  if !output.status.success() {
    return Err(format!(
      "git ls-files exited with {:?}: {}",
      output.status.code(),
      String::from_utf8_lossy(&output.stderr).trim()
    ));
  }

  Ok(parse_file_list(&output.stdout))
}

fn parse_file_list(stdout: &[u8]) -> Vec<PathBuf> {
  stdout
    .split(|b| *b == 0)
    .filter(|entry| !entry.is_empty())
    .map(|entry| PathBuf::from(String::from_utf8_lossy(entry).into_owned()))
    .collect()
}
