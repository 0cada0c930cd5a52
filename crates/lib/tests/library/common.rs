//! Shared helpers for the library integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tempfile::TempDir;

use polyversion_lib::builder::{BuildError, Builder};
use polyversion_lib::codec::Value;
use polyversion_lib::environment::{Environment, PlainEnvironment};
use polyversion_lib::provider::{DiscoveryError, MaterializeError, RevisionProvider};
use polyversion_lib::{Driver, Revision, RevisionKind};

/// File written by [`FakeProvider`] into each checkout.
pub const MARKER: &str = "REVISION";

pub fn timestamp(secs: i64) -> DateTime<FixedOffset> {
  DateTime::from_timestamp(secs, 0).unwrap().fixed_offset()
}

pub fn rev(name: &str, kind: RevisionKind, secs: i64) -> Revision {
  let prefix = match kind {
    RevisionKind::Tag => "refs/tags",
    _ => "refs/heads",
  };
  Revision::new(name, format!("{name}-sha"), format!("{prefix}/{name}"), kind, timestamp(secs))
}

pub fn branch(name: &str, secs: i64) -> Revision {
  rev(name, RevisionKind::Branch, secs)
}

pub fn tag(name: &str, secs: i64) -> Revision {
  rev(name, RevisionKind::Tag, secs)
}

/// Provider serving a fixed list of revisions.
///
/// Materializing writes [`MARKER`] containing the revision name.
#[derive(Default)]
pub struct FakeProvider {
  pub revisions: Vec<Revision>,
  pub rejected: HashSet<String>,
  pub broken: HashSet<String>,
  pub discovery_fails: bool,
}

impl FakeProvider {
  pub fn new(revisions: Vec<Revision>) -> Self {
    Self {
      revisions,
      ..Self::default()
    }
  }

  /// Fail materializing these revisions.
  pub fn with_broken(mut self, names: &[&str]) -> Self {
    self.broken = names.iter().map(|n| n.to_string()).collect();
    self
  }

  /// Filter these revisions out.
  pub fn with_rejected(mut self, names: &[&str]) -> Self {
    self.rejected = names.iter().map(|n| n.to_string()).collect();
    self
  }
}

#[async_trait]
impl RevisionProvider for FakeProvider {
  async fn list_candidates(&self, root: &Path) -> Result<Vec<Revision>, DiscoveryError> {
    if self.discovery_fails {
      return Err(DiscoveryError::NotARepository {
        path: root.to_path_buf(),
      });
    }
    Ok(self.revisions.clone())
  }

  async fn passes_filter(&self, _root: &Path, revision: &Revision) -> bool {
    !self.rejected.contains(&revision.name)
  }

  async fn materialize(&self, _root: &Path, dest: &Path, revision: &Revision) -> Result<(), MaterializeError> {
    if self.broken.contains(&revision.name) {
      return Err(MaterializeError::Unpack {
        revision: revision.name.clone(),
        message: "injected failure".into(),
      });
    }
    tokio::fs::write(dest.join(MARKER), &revision.name).await?;
    Ok(())
  }
}

/// Builder copying the checkout marker into `index.html`.
#[derive(Default)]
pub struct FakeBuilder {
  pub failing: HashSet<String>,
  pub panicking: HashSet<String>,
  pub delay: Option<Duration>,
  pub running: AtomicUsize,
  pub peak: AtomicUsize,
}

impl FakeBuilder {
  pub fn failing(names: &[&str]) -> Self {
    Self {
      failing: names.iter().map(|n| n.to_string()).collect(),
      ..Self::default()
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Builder for FakeBuilder {
  async fn build(&self, environment: &dyn Environment, output_dir: &Path, data: &Value) -> Result<Value, BuildError> {
    let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(running, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.running.fetch_sub(1, Ordering::SeqCst);

    let name = environment.name().to_string();
    if self.panicking.contains(&name) {
      panic!("builder exploded for {name}");
    }
    if self.failing.contains(&name) {
      return Err(BuildError::CommandFailed {
        cmd: "fake-build".into(),
        code: Some(2),
        stdout: String::new(),
        stderr: format!("cannot build {name}"),
      });
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let marker = tokio::fs::read_to_string(environment.path().join(MARKER))
      .await
      .unwrap_or_default();
    let current = data
      .get("current")
      .and_then(|c| c.downcast_ref::<Revision>())
      .map(|r| r.name.clone())
      .unwrap_or_default();
    tokio::fs::write(output_dir.join("index.html"), format!("{marker}|{current}")).await?;
    tokio::fs::write(output_dir.join("files.txt"), checkout_listing(environment.path()).join("\n")).await?;
    Ok(Value::Null)
  }
}

/// Sorted names of the top-level entries of `dir`.
pub fn checkout_listing(dir: &Path) -> Vec<String> {
  let mut names: Vec<String> = std::fs::read_dir(dir)
    .map(|entries| {
      entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
    })
    .unwrap_or_default();
  names.sort();
  names
}

/// A driver over a fake provider and builder writing to `<temp>/out`.
pub fn fake_driver(temp: &TempDir, provider: FakeProvider, builder: Arc<FakeBuilder>) -> Driver {
  let builder: Arc<dyn Builder> = builder;
  Driver::new(
    temp.path().join("repo"),
    temp.path().join("out"),
    Arc::new(provider),
    builder,
    PlainEnvironment::factory(),
  )
}

/// Names of the subdirectories of `dir`, sorted.
pub fn subdirs(dir: &Path) -> Vec<String> {
  let mut names: Vec<String> = std::fs::read_dir(dir)
    .unwrap()
    .filter_map(|e| e.ok())
    .filter(|e| e.path().is_dir())
    .map(|e| e.file_name().to_string_lossy().into_owned())
    .collect();
  names.sort();
  names
}

pub fn sorted(mut names: Vec<String>) -> Vec<String> {
  names.sort();
  names
}

pub fn names(revisions: &[Revision]) -> Vec<String> {
  sorted(revisions.iter().map(|r| r.name.clone()).collect())
}

/// A scratch git repository.
pub struct TestRepo {
  pub temp: TempDir,
}

impl TestRepo {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let repo = Self { temp };
    repo.git(&["init", "-q"]);
    repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
    repo
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  /// Run git in the repository and return its stdout.
  pub fn git(&self, args: &[&str]) -> String {
    git_in(self.path(), args)
  }

  pub fn write_file(&self, rel: &str, content: &str) -> PathBuf {
    let path = self.path().join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Stage everything and commit; returns the commit hash.
  pub fn commit(&self, message: &str) -> String {
    self.git(&["add", "-A"]);
    self.git(&["commit", "-q", "--allow-empty", "-m", message]);
    self.git(&["rev-parse", "HEAD"]).trim().to_string()
  }
}

pub fn git_in(dir: &Path, args: &[&str]) -> String {
  let output = Command::new("git")
    .current_dir(dir)
    .env_remove("GIT_DIR")
    .env_remove("GIT_WORK_TREE")
    .env_remove("GIT_INDEX_FILE")
    .env("GIT_CONFIG_NOSYSTEM", "1")
    .args([
      "-c",
      "user.name=Polyversion Tests",
      "-c",
      "user.email=tests@polyversion.invalid",
      "-c",
      "commit.gpgsign=false",
      "-c",
      "tag.gpgsign=false",
      "-c",
      "protocol.file.allow=always",
    ])
    .args(args)
    .output()
    .unwrap();
  assert!(
    output.status.success(),
    "git {:?} failed: {}",
    args,
    String::from_utf8_lossy(&output.stderr)
  );
  String::from_utf8_lossy(&output.stdout).into_owned()
}
