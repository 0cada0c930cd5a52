//! Types for running the driver.
//!
//! Error types, the run report and the factory signatures accepted by
//! [`Driver`](super::Driver).

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use super::Driver;
use super::select::SelectError;
use crate::builder::BuildError;
use crate::codec::{CodecError, Value};
use crate::environment::Environment;
use crate::provider::{DiscoveryError, MaterializeError};
use crate::revision::Revision;

/// Errors that end a single revision's build.
///
/// These never escape the task they happen in; the driver records them in
/// [`RunReport::failures`].
#[derive(Debug, Error)]
pub enum TaskError {
  /// No builder, environment or data factory could be chosen.
  #[error("selection failed: {0}")]
  Select(#[from] SelectError),

  /// The temporary workspace could not be prepared.
  #[error("workspace error: {0}")]
  Workspace(#[source] std::io::Error),

  #[error("checkout failed: {0}")]
  Materialize(#[from] MaterializeError),

  #[error(transparent)]
  Build(#[from] BuildError),

  /// The task panicked.
  #[error("build task panicked: {0}")]
  Panicked(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum DriverError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The build targets could not be determined.
  #[error("discovery failed: {0}")]
  Discovery(#[from] DiscoveryError),

  /// The manifest of successful builds could not be encoded.
  #[error("codec error: {0}")]
  Codec(#[from] CodecError),

  #[error("template error: {0}")]
  Template(#[from] minijinja::Error),

  /// The single build of a local run failed.
  #[error("local build failed: {0}")]
  Local(#[from] TaskError),
}

/// A revision whose build failed, and why.
#[derive(Debug)]
pub struct BuildFailure {
  pub revision: Revision,
  pub error: TaskError,
}

/// Outcome of a run.
#[derive(Debug, Default)]
pub struct RunReport {
  /// Every revision a build was attempted for.
  pub targets: Vec<Revision>,
  /// Revisions that built successfully, in completion order unless sorted.
  pub builds: Vec<Revision>,
  pub failures: Vec<BuildFailure>,
}

impl RunReport {
  /// Whether every target built.
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }

  pub fn build_names(&self) -> Vec<&str> {
    self.builds.iter().map(|r| r.name.as_str()).collect()
  }

  pub fn failed_names(&self) -> Vec<&str> {
    self.failures.iter().map(|f| f.revision.name.as_str()).collect()
  }
}

/// Targets and current revision used instead of discovery in local mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockData {
  pub current: Revision,
  pub revisions: Vec<Revision>,
}

/// Everything a data factory may look at to build a revision's metadata.
pub struct DataRequest<'a> {
  pub driver: &'a Driver,
  pub targets: &'a [Revision],
  pub revision: &'a Revision,
  pub environment: &'a dyn Environment,
}

/// Builds the metadata passed to the builder for one revision.
pub type DataFactory = Arc<dyn Fn(&DataRequest<'_>) -> Value + Send + Sync>;

/// Builds the template context of the root-merge pass.
pub type RootDataFactory = Arc<dyn Fn(&Driver, &RunReport) -> Value + Send + Sync>;

/// Names a revision's output subdirectory.
pub type Namer = Arc<dyn Fn(&Revision) -> String + Send + Sync>;

/// Default metadata: `{"revisions": targets, "current": revision}`.
pub fn default_data(targets: &[Revision], revision: &Revision) -> Value {
  Value::map([
    ("revisions", Value::from(targets.to_vec())),
    ("current", Value::from(revision.clone())),
  ])
}

/// Default root context: `{"revisions": builds, "root": root}`.
pub fn default_root_data(builds: &[Revision], root: &Path) -> Value {
  Value::map([
    ("revisions", Value::from(builds.to_vec())),
    ("root", Value::from(root.to_string_lossy().into_owned())),
  ])
}
