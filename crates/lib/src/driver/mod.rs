//! Orchestration of multi-revision builds.
//!
//! The [`Driver`] discovers the revisions to build, runs one isolated build
//! per revision concurrently and merges the successful ones into the output
//! root:
//!
//! 1. Create the output directory and retrieve the targets from the provider
//! 2. Spawn one task per target (optionally bounded by a semaphore)
//! 3. In each task: workspace, checkout, environment, metadata, build
//! 4. Collect failures without cancelling other tasks
//! 5. Run the root-merge pass once over the successful builds
//!
//! Only failures in step 1 abort the run. A failed revision is logged, listed
//! in [`RunReport::failures`] and left out of the merged output.

pub mod root;
pub mod select;
pub mod types;
pub mod workspace;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tempfile::TempDir;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::builder::Builder;
use crate::codec::{Codec, Value};
use crate::environment::{Environment, EnvironmentFactory};
use crate::provider::RevisionProvider;
use crate::revision::{Revision, sort_by_created};

pub use root::MANIFEST_FILE;
pub use select::{SelectError, Selectable, Selector, closest_tag_selector, name_selector};
pub use types::{
  BuildFailure, DataFactory, DataRequest, DriverError, MockData, Namer, RootDataFactory, RunReport, TaskError,
  default_data, default_root_data,
};
pub use workspace::copy_working_tree;

/// Output subdirectory used by local runs.
pub const LOCAL_DIR: &str = "local";

/// Builds every revision offered by a provider and merges the results.
///
/// Cheap to clone; every task owns a clone.
#[derive(Clone)]
pub struct Driver {
  root: PathBuf,
  output_dir: PathBuf,
  provider: Arc<dyn RevisionProvider>,
  builder: Selectable<Arc<dyn Builder>>,
  env: Selectable<EnvironmentFactory>,
  data_factory: Option<Selectable<DataFactory>>,
  root_data_factory: Option<RootDataFactory>,
  namer: Option<Namer>,
  codec: Arc<Codec>,
  static_dir: Option<PathBuf>,
  template_dir: Option<PathBuf>,
  parallelism: Option<usize>,
  sort_builds: bool,
}

impl fmt::Debug for Driver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Driver")
      .field("root", &self.root)
      .field("output_dir", &self.output_dir)
      .field("builder", &self.builder)
      .field("env", &self.env)
      .field("static_dir", &self.static_dir)
      .field("template_dir", &self.template_dir)
      .field("parallelism", &self.parallelism)
      .field("sort_builds", &self.sort_builds)
      .finish_non_exhaustive()
  }
}

impl Driver {
  /// Relative paths are resolved against the current directory.
  pub fn new(
    root: impl Into<PathBuf>,
    output_dir: impl Into<PathBuf>,
    provider: Arc<dyn RevisionProvider>,
    builder: impl Into<Selectable<Arc<dyn Builder>>>,
    env: impl Into<Selectable<EnvironmentFactory>>,
  ) -> Self {
    Self {
      root: absolute(root.into()),
      output_dir: absolute(output_dir.into()),
      provider,
      builder: builder.into(),
      env: env.into(),
      data_factory: None,
      root_data_factory: None,
      namer: None,
      codec: Arc::new(Codec::global().clone()),
      static_dir: None,
      template_dir: None,
      parallelism: None,
      sort_builds: false,
    }
  }

  pub fn with_data_factory(mut self, factory: impl Into<Selectable<DataFactory>>) -> Self {
    self.data_factory = Some(factory.into());
    self
  }

  pub fn with_root_data_factory(mut self, factory: RootDataFactory) -> Self {
    self.root_data_factory = Some(factory);
    self
  }

  pub fn with_namer(mut self, namer: Namer) -> Self {
    self.namer = Some(namer);
    self
  }

  pub fn with_codec(mut self, codec: Codec) -> Self {
    self.codec = Arc::new(codec);
    self
  }

  pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.static_dir = Some(dir.into());
    self
  }

  pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.template_dir = Some(dir.into());
    self
  }

  /// Limit the number of concurrent builds. `None` means unbounded.
  pub fn with_parallelism(mut self, parallelism: Option<usize>) -> Self {
    self.parallelism = parallelism.map(|n| n.max(1));
    self
  }

  /// Sort successful builds by creation time before the root-merge pass.
  pub fn with_sorted_builds(mut self, sort: bool) -> Self {
    self.sort_builds = sort;
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  pub fn codec(&self) -> &Codec {
    &self.codec
  }

  /// Name of the output subdirectory for `revision`.
  pub fn name_for(&self, revision: &Revision) -> String {
    match &self.namer {
      Some(namer) => namer(revision),
      None => self.provider.unique_name(revision),
    }
  }

  /// Build all revisions and merge the successful ones.
  pub async fn run(&self) -> Result<RunReport, DriverError> {
    tokio::fs::create_dir_all(&self.output_dir).await?;
    let targets = self.provider.retrieve(&self.root).await?;
    info!(targets = targets.len(), output = ?self.output_dir, "building revisions");

    let shared: Arc<[Revision]> = targets.clone().into();
    let builds = Arc::new(Mutex::new(Vec::with_capacity(targets.len())));
    let semaphore = self.parallelism.map(|n| Arc::new(Semaphore::new(n)));

    let mut join_set = JoinSet::new();
    for revision in targets.iter().cloned() {
      let driver = self.clone();
      let targets = shared.clone();
      let builds = builds.clone();
      let semaphore = semaphore.clone();
      let span = info_span!("revision", name = %revision.name);

      join_set.spawn(
        async move {
          // held until the task ends
          let _permit = match semaphore {
            Some(semaphore) => semaphore.acquire_owned().await.ok(),
            None => None,
          };

          let result = AssertUnwindSafe(driver.build_revision(&revision, &targets))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));

          if result.is_ok() {
            builds.lock().await.push(revision.clone());
          }
          (revision, result.map(|_| ()))
        }
        .instrument(span),
      );
    }

    let mut failures = Vec::new();
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((revision, Ok(()))) => {
          info!(revision = %revision.name, "build succeeded");
        }
        Ok((revision, Err(e))) => {
          error!(revision = %revision.name, error = %e, "build failed");
          failures.push(BuildFailure { revision, error: e });
        }
        Err(e) => {
          error!(error = %e, "build task aborted");
        }
      }
    }

    let mut builds = std::mem::take(&mut *builds.lock().await);
    if self.sort_builds {
      sort_by_created(&mut builds);
    }

    let report = RunReport {
      targets,
      builds,
      failures,
    };
    info!(
      built = report.builds.len(),
      failed = report.failures.len(),
      "revision builds complete"
    );

    self.build_root(&report).await?;
    Ok(report)
  }

  /// Build one revision in a fresh workspace.
  ///
  /// Returns the builder's artifact. The environment is exited and the
  /// workspace removed on every path.
  pub async fn build_revision(&self, revision: &Revision, targets: &[Revision]) -> Result<Value, TaskError> {
    let workspace = TempDir::new().map_err(TaskError::Workspace)?;
    debug!(workspace = ?workspace.path(), "created workspace");

    let result = async {
      self.provider.materialize(&self.root, workspace.path(), revision).await?;
      let output = self.output_dir.join(self.name_for(revision));
      self.build_in(workspace.path(), revision, targets, &output).await
    }
    .await;

    close_workspace(workspace).await;
    result
  }

  /// Build `revision` from the files at `checkout` into `output`.
  async fn build_in(
    &self,
    checkout: &Path,
    revision: &Revision,
    targets: &[Revision],
    output: &Path,
  ) -> Result<Value, TaskError> {
    let builder = self.builder.resolve(revision).await?.clone();
    let factory = self.env.resolve(revision).await?.clone();

    let mut environment = factory(checkout, &self.name_for(revision));
    let result = AssertUnwindSafe(self.enter_and_build(environment.as_mut(), builder.as_ref(), revision, targets, output))
      .catch_unwind()
      .await
      .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));
    let exited = environment.exit().await;

    let artifact = result?;
    exited?;
    Ok(artifact)
  }

  async fn enter_and_build(
    &self,
    environment: &mut dyn Environment,
    builder: &dyn Builder,
    revision: &Revision,
    targets: &[Revision],
    output: &Path,
  ) -> Result<Value, TaskError> {
    environment.enter().await?;
    let data = self.data_for(revision, targets, &*environment).await?;
    info!(output = ?output, "building");
    Ok(builder.build(&*environment, output, &data).await?)
  }

  /// Metadata for one revision's build.
  async fn data_for(
    &self,
    revision: &Revision,
    targets: &[Revision],
    environment: &dyn Environment,
  ) -> Result<Value, TaskError> {
    let Some(factories) = &self.data_factory else {
      return Ok(default_data(targets, revision));
    };
    let factory = factories.resolve(revision).await?;
    Ok(factory(&DataRequest {
      driver: self,
      targets,
      revision,
      environment,
    }))
  }

  /// Build only the working tree as `mock.current`, then run the root-merge
  /// pass with the mock revisions as the successful builds.
  pub async fn run_local(&self, mock: MockData) -> Result<RunReport, DriverError> {
    tokio::fs::create_dir_all(&self.output_dir).await?;

    let MockData { current, mut revisions } = mock;
    if !revisions.contains(&current) {
      revisions.push(current.clone());
    }

    let workspace = TempDir::new()?;
    let result = async {
      copy_working_tree(&self.root, workspace.path())
        .await
        .map_err(TaskError::Workspace)?;
      let output = self.output_dir.join(LOCAL_DIR);
      self.build_in(workspace.path(), &current, &revisions, &output).await
    }
    .instrument(info_span!("revision", name = %current.name))
    .await;
    close_workspace(workspace).await;

    if let Err(e) = &result {
      error!(revision = %current.name, error = %e, "build failed");
    }
    result?;

    let report = RunReport {
      targets: revisions.clone(),
      builds: revisions,
      failures: Vec::new(),
    };
    self.build_root(&report).await?;
    Ok(report)
  }

  /// The root-merge pass.
  pub async fn build_root(&self, report: &RunReport) -> Result<(), DriverError> {
    root::write_manifest(&self.codec, &self.output_dir, &report.builds).await?;

    if let Some(dir) = &self.static_dir {
      root::copy_static(dir, &self.output_dir).await?;
    }

    if let Some(dir) = &self.template_dir {
      let context = match &self.root_data_factory {
        Some(factory) => factory(self, report),
        None => default_root_data(&report.builds, &self.root),
      };
      root::render_templates(dir, &self.output_dir, self.codec.to_plain(&context)).await?;
    }
    Ok(())
  }
}

async fn close_workspace(workspace: TempDir) {
  let path = workspace.path().to_path_buf();
  match tokio::task::spawn_blocking(move || workspace.close()).await {
    Ok(Ok(())) => debug!(workspace = ?path, "removed workspace"),
    Ok(Err(e)) => warn!(workspace = ?path, error = %e, "failed to remove workspace"),
    Err(e) => warn!(workspace = ?path, error = %e, "failed to remove workspace"),
  }
}

fn absolute(path: PathBuf) -> PathBuf {
  std::path::absolute(&path).unwrap_or(path)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
