//! Inclusion rules for revisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tracing::{debug, warn};

use super::DiscoveryError;
use super::git::git_command;
use crate::revision::{Revision, RevisionKind};

/// An additional, possibly expensive, condition on a revision.
#[async_trait]
pub trait RevisionPredicate: Send + Sync {
  async fn check(&self, root: &Path, revision: &Revision) -> Result<bool, DiscoveryError>;
}

/// Name, origin and predicate rules, all of which must hold.
#[derive(Clone)]
pub struct RefFilter {
  branch: Regex,
  tag: Regex,
  remote: Option<String>,
  predicate: Option<Arc<dyn RevisionPredicate>>,
}

impl std::fmt::Debug for RefFilter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RefFilter")
      .field("branch", &self.branch.as_str())
      .field("tag", &self.tag.as_str())
      .field("remote", &self.remote)
      .field("predicate", &self.predicate.is_some())
      .finish()
  }
}

impl RefFilter {
  /// Build a filter from branch and tag patterns.
  ///
  /// Patterns must match the whole name. Without a remote only local refs are
  /// accepted; with a remote only that remote's branches are.
  pub fn new(branch_pattern: &str, tag_pattern: &str) -> Result<Self, regex::Error> {
    Ok(Self {
      branch: anchored(branch_pattern)?,
      tag: anchored(tag_pattern)?,
      remote: None,
      predicate: None,
    })
  }

  pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
    self.remote = Some(remote.into());
    self
  }

  pub fn with_predicate(mut self, predicate: impl RevisionPredicate + 'static) -> Self {
    self.predicate = Some(Arc::new(predicate));
    self
  }

  pub fn remote(&self) -> Option<&str> {
    self.remote.as_deref()
  }

  /// Whether the name matches the pattern for the revision's kind.
  pub fn matches_name(&self, revision: &Revision) -> bool {
    match revision.kind {
      RevisionKind::Tag => self.tag.is_match(&revision.name),
      RevisionKind::Branch => self.branch.is_match(&revision.name),
    }
  }

  /// Whether the revision comes from the selected origin.
  pub fn matches_origin(&self, revision: &Revision) -> bool {
    revision.origin_name.as_deref() == self.remote.as_deref()
  }

  /// Evaluate all rules. A failing predicate counts as a rejection.
  pub async fn accepts(&self, root: &Path, revision: &Revision) -> bool {
    if !(self.matches_name(revision) && self.matches_origin(revision)) {
      return false;
    }

    let Some(predicate) = &self.predicate else {
      return true;
    };

    match predicate.check(root, revision).await {
      Ok(keep) => keep,
      Err(e) => {
        warn!(revision = %revision.name, error = %e, "predicate failed, excluding revision");
        false
      }
    }
  }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
  Regex::new(&format!("^(?:{})$", pattern))
}

/// Holds when every listed path exists in the revision.
#[derive(Debug, Clone)]
pub struct FilePredicate {
  paths: Vec<PathBuf>,
}

impl FilePredicate {
  pub fn new<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    Self {
      paths: paths.into_iter().map(Into::into).collect(),
    }
  }
}

#[async_trait]
impl RevisionPredicate for FilePredicate {
  async fn check(&self, root: &Path, revision: &Revision) -> Result<bool, DiscoveryError> {
    let checks = self.paths.iter().map(|path| file_exists(root, &revision.content_id, path));
    let results = join_all(checks).await;

    let mut all = true;
    for result in results {
      all &= result?;
    }
    Ok(all)
  }
}

/// Whether `path` exists in the tree of `object`.
pub async fn file_exists(root: &Path, object: &str, path: &Path) -> Result<bool, DiscoveryError> {
  // git object paths always use forward slashes
  let spec = format!("{}:{}", object, path.to_string_lossy().replace('\\', "/"));
  let status = git_command(root)
    .args(["cat-file", "-e", &spec])
    .stdout(std::process::Stdio::null())
    .stderr(std::process::Stdio::null())
    .status()
    .await?;
  debug!(object = %spec, exists = status.success(), "checked file");
  Ok(status.success())
}
