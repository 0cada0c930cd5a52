//! Revision providers.
//!
//! A [`RevisionProvider`] lists the revisions known to a backing store, decides
//! which of them belong to a run and produces a plain directory tree for a
//! single revision. [`git::GitProvider`] is the implementation backed by the
//! `git` command line.

pub mod filter;
pub mod git;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info};

use crate::revision::Revision;

pub use filter::{FilePredicate, RefFilter, RevisionPredicate};
pub use git::GitProvider;

/// The list of revisions could not be determined.
#[derive(Debug, Error)]
pub enum DiscoveryError {
  /// The root is not a repository the provider can query.
  #[error("not a repository: {}", path.display())]
  NotARepository { path: PathBuf },

  /// A backend command failed.
  #[error("command failed with exit code {code:?}: {cmd}: {stderr}")]
  CommandFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  /// I/O error while talking to the backend.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// A revision's files could not be produced.
#[derive(Debug, Error)]
pub enum MaterializeError {
  /// A backend command failed.
  #[error("command failed with exit code {code:?}: {cmd}: {stderr}")]
  CommandFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The snapshot could not be unpacked.
  #[error("failed to unpack {revision}: {message}")]
  Unpack { revision: String, message: String },

  /// I/O error while writing the tree.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Backend capability for listing, filtering and materializing revisions.
#[async_trait]
pub trait RevisionProvider: Send + Sync {
  /// Every revision known under `root`, independent of any filter.
  ///
  /// Unparseable or irrelevant entries are skipped; only a backend that cannot
  /// be queried at all is an error.
  async fn list_candidates(&self, root: &Path) -> Result<Vec<Revision>, DiscoveryError>;

  /// Whether `revision` belongs to this run's targets.
  async fn passes_filter(&self, root: &Path, revision: &Revision) -> bool;

  /// Write the files of `revision` to `dest`.
  async fn materialize(&self, root: &Path, dest: &Path, revision: &Revision) -> Result<(), MaterializeError>;

  /// Deterministic, filesystem-safe directory name for `revision`.
  fn unique_name(&self, revision: &Revision) -> String {
    sanitize_name(&revision.name)
  }

  /// List candidates and keep those passing the filter, in listing order.
  ///
  /// Filters are evaluated concurrently.
  async fn retrieve(&self, root: &Path) -> Result<Vec<Revision>, DiscoveryError> {
    let candidates = self.list_candidates(root).await?;
    debug!(count = candidates.len(), "listed candidate revisions");

    let verdicts = join_all(candidates.iter().map(|rev| self.passes_filter(root, rev))).await;
    let targets: Vec<Revision> = candidates
      .into_iter()
      .zip(verdicts)
      .filter_map(|(rev, keep)| keep.then_some(rev))
      .collect();

    info!(count = targets.len(), "selected revisions");
    Ok(targets)
  }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `-`.
pub fn sanitize_name(name: &str) -> String {
  name
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
        c
      } else {
        '-'
      }
    })
    .collect()
}
