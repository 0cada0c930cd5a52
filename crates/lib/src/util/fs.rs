//! Filesystem helpers.
//!
//! Bulk copies are synchronous; the `*_async` variants run them on the
//! blocking thread pool.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Map `src` from below `src_anchor` to the same relative location below
/// `dst_anchor`. `None` when `src` is not below `src_anchor`.
pub fn shift_path(src_anchor: &Path, dst_anchor: &Path, src: &Path) -> Option<PathBuf> {
  src.strip_prefix(src_anchor).ok().map(|rel| dst_anchor.join(rel))
}

/// Recursively copy the contents of `src` into `dst`, creating directories as
/// needed. Existing files are overwritten. Returns the number of files copied.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<u64> {
  let mut copied = 0;
  std::fs::create_dir_all(dst)?;

  for entry in WalkDir::new(src).min_depth(1) {
    let entry = entry?;
    let Some(target) = shift_path(src, dst, entry.path()) else {
      continue;
    };

    let file_type = entry.file_type();
    if file_type.is_dir() {
      std::fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      copy_symlink(entry.path(), &target)?;
      copied += 1;
    } else {
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::copy(entry.path(), &target)?;
      copied += 1;
    }
  }

  debug!(src = ?src, dst = ?dst, files = copied, "copied directory");
  Ok(copied)
}

/// Copy the listed paths (relative to `src`) to the same locations below
/// `dst`. Entries that no longer exist are skipped; directories are copied
/// recursively.
pub fn copy_listed(src: &Path, dst: &Path, paths: &[PathBuf]) -> io::Result<u64> {
  let mut copied = 0;
  std::fs::create_dir_all(dst)?;

  for rel in paths {
    let from = src.join(rel);
    let to = dst.join(rel);
    let Ok(meta) = std::fs::symlink_metadata(&from) else {
      debug!(path = ?from, "listed path missing, skipping");
      continue;
    };

    if let Some(parent) = to.parent() {
      std::fs::create_dir_all(parent)?;
    }
    if meta.is_dir() {
      copied += copy_dir_all(&from, &to)?;
    } else if meta.file_type().is_symlink() {
      copy_symlink(&from, &to)?;
      copied += 1;
    } else {
      std::fs::copy(&from, &to)?;
      copied += 1;
    }
  }

  Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
  let target = std::fs::read_link(from)?;
  if std::fs::symlink_metadata(to).is_ok() {
    std::fs::remove_file(to)?;
  }
  std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
  // no portable way to recreate the link, copy what it points to
  if std::fs::metadata(from)?.is_dir() {
    copy_dir_all(from, to).map(|_| ())
  } else {
    std::fs::copy(from, to).map(|_| ())
  }
}

/// [`copy_dir_all`] on the blocking thread pool.
pub async fn copy_dir_all_async(src: PathBuf, dst: PathBuf) -> io::Result<u64> {
  tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst))
    .await
    .map_err(io::Error::other)?
}

/// [`copy_listed`] on the blocking thread pool.
pub async fn copy_listed_async(src: PathBuf, dst: PathBuf, paths: Vec<PathBuf>) -> io::Result<u64> {
  tokio::task::spawn_blocking(move || copy_listed(&src, &dst, &paths))
    .await
    .map_err(io::Error::other)?
}
