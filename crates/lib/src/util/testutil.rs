//! Test utilities for polyversion-lib.
//!
//! Cross-platform helpers for tests that need to run shell commands.

/// Command line running `script` in the platform shell.
#[cfg(unix)]
pub fn shell(script: &str) -> Vec<String> {
  vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

#[cfg(windows)]
pub fn shell(script: &str) -> Vec<String> {
  vec!["cmd.exe".to_string(), "/C".to_string(), script.to_string()]
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &std::path::Path, rel: &str, contents: &str) {
  let path = root.join(rel);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, contents).unwrap();
}
