//! The root-merge pass.
//!
//! Runs once after every revision build finished: writes the manifest of
//! successful builds, copies static files and renders templates into the
//! output root.

use std::path::{Path, PathBuf};

use minijinja::{Environment, path_loader};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::DriverError;
use crate::codec::{Codec, Value};
use crate::revision::Revision;
use crate::util::fs::copy_dir_all_async;

/// File in the output root listing the successful builds.
pub const MANIFEST_FILE: &str = "versions.json";

/// Write the codec-encoded `builds` to [`MANIFEST_FILE`] below `output_dir`.
pub async fn write_manifest(codec: &Codec, output_dir: &Path, builds: &[Revision]) -> Result<PathBuf, DriverError> {
  let encoded = codec.encode(&Value::from(builds.to_vec()))?;
  let path = output_dir.join(MANIFEST_FILE);
  tokio::fs::write(&path, encoded).await?;
  debug!(path = ?path, builds = builds.len(), "wrote manifest");
  Ok(path)
}

/// Copy the static directory into the output root. A missing directory is
/// skipped.
pub async fn copy_static(static_dir: &Path, output_dir: &Path) -> Result<u64, DriverError> {
  if !static_dir.is_dir() {
    debug!(dir = ?static_dir, "no static directory");
    return Ok(0);
  }
  info!(dir = ?static_dir, "copying static files to root directory");
  Ok(copy_dir_all_async(static_dir.to_path_buf(), output_dir.to_path_buf()).await?)
}

/// Render every template below `template_dir` to the same relative path below
/// `output_dir`. Returns the number of rendered files.
pub async fn render_templates(
  template_dir: &Path,
  output_dir: &Path,
  context: serde_json::Value,
) -> Result<usize, DriverError> {
  if !template_dir.is_dir() {
    debug!(dir = ?template_dir, "no template directory");
    return Ok(0);
  }
  info!(dir = ?template_dir, "rendering templates");

  let template_dir = template_dir.to_path_buf();
  let output_dir = output_dir.to_path_buf();
  tokio::task::spawn_blocking(move || render_all(&template_dir, &output_dir, &context))
    .await
    .map_err(std::io::Error::other)?
}

fn render_all(template_dir: &Path, output_dir: &Path, context: &serde_json::Value) -> Result<usize, DriverError> {
  let mut env = Environment::new();
  env.set_loader(path_loader(template_dir));

  let names = list_templates(template_dir)?;
  for name in &names {
    let rendered = env.get_template(name)?.render(context)?;
    let target = output_dir.join(name);
    if let Some(parent) = target.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, rendered)?;
    debug!(template = %name, "rendered template");
  }
  Ok(names.len())
}

/// Template names: file paths relative to `dir` joined with `/`.
fn list_templates(dir: &Path) -> std::io::Result<Vec<String>> {
  let mut names = Vec::new();
  for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
    let entry = entry?;
    if !entry.file_type().is_file() {
      continue;
    }
    let Ok(rel) = entry.path().strip_prefix(dir) else {
      continue;
    };
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    names.push(parts.join("/"));
  }
  Ok(names)
}
