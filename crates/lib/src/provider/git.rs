//! Git-backed revision provider.
//!
//! Everything goes through the `git` command line:
//! - `for-each-ref` lists branches, tags and remote branches
//! - `archive` exports a commit's tree, which is unpacked with the `tar` crate
//! - `ls-tree` finds gitlinks so nested repositories can be exported too
//! - `cat-file` / `merge-base` answer predicate and selector questions

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::DateTime;
use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::filter::RefFilter;
use super::{DiscoveryError, MaterializeError, RevisionProvider};
use crate::revision::{Revision, RevisionKind};

/// Format passed to `git for-each-ref`.
pub const REF_FORMAT: &str = "%(objectname)\t%(refname)\t%(creatordate:iso-strict)";

/// A `git` command rooted at `repo`, insulated from the caller's git variables.
pub(crate) fn git_command(repo: &Path) -> Command {
  let mut cmd = Command::new("git");
  cmd
    .current_dir(repo)
    .env_remove("GIT_DIR")
    .env_remove("GIT_WORK_TREE")
    .env_remove("GIT_INDEX_FILE")
    .kill_on_drop(true);
  cmd
}

struct GitOutput {
  code: Option<i32>,
  stdout: Vec<u8>,
  stderr: String,
}

impl GitOutput {
  fn success(&self) -> bool {
    self.code == Some(0)
  }
}

async fn run_git(repo: &Path, args: &[&str]) -> std::io::Result<GitOutput> {
  debug!(repo = ?repo, args = ?args, "running git");
  let output = git_command(repo)
    .args(args)
    .stdin(Stdio::null())
    .output()
    .await?;
  Ok(GitOutput {
    code: output.status.code(),
    stdout: output.stdout,
    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
  })
}

fn describe(args: &[&str]) -> String {
  format!("git {}", args.join(" "))
}

/// Parse one line of `for-each-ref` output in [`REF_FORMAT`].
///
/// Returns `None` for lines that are malformed (logged as a warning) or refs
/// that are neither branches nor tags (logged at info level).
pub fn parse_ref(line: &str) -> Option<Revision> {
  let mut parts = line.splitn(3, '\t');
  let (Some(object), Some(refname), Some(date)) = (parts.next(), parts.next(), parts.next()) else {
    warn!(line = %line, "malformed ref line");
    return None;
  };

  let created_at = match DateTime::parse_from_rfc3339(date.trim()) {
    Ok(ts) => ts,
    Err(e) => {
      warn!(line = %line, error = %e, "invalid ref date");
      return None;
    }
  };

  let (kind, remote, name) = split_refname(refname)?;

  let revision = Revision::new(name, object, refname, kind, created_at);
  Some(match remote {
    Some(remote) => revision.with_origin(remote),
    None => revision,
  })
}

/// Classify a full ref name into `(kind, remote, short name)`.
fn split_refname(refname: &str) -> Option<(RevisionKind, Option<&str>, &str)> {
  let Some((namespace, rest)) = refname.strip_prefix("refs/").and_then(|r| r.split_once('/')) else {
    warn!(refname = %refname, "invalid ref");
    return None;
  };
  if rest.is_empty() || rest.contains(char::is_whitespace) {
    warn!(refname = %refname, "invalid ref");
    return None;
  }

  match namespace {
    "heads" => Some((RevisionKind::Branch, None, rest)),
    "tags" => Some((RevisionKind::Tag, None, rest)),
    "remotes" => match rest.split_once('/') {
      Some((remote, name)) if !remote.is_empty() && !name.is_empty() => Some((RevisionKind::Branch, Some(remote), name)),
      _ => {
        warn!(refname = %refname, "invalid remote ref");
        None
      }
    },
    _ => {
      info!(refname = %refname, "ignoring ref");
      None
    }
  }
}

/// Revisions from a git repository.
#[derive(Debug, Clone)]
pub struct GitProvider {
  filter: RefFilter,
  fetch_remote: Option<String>,
}

impl GitProvider {
  pub fn new(filter: RefFilter) -> Self {
    Self {
      filter,
      fetch_remote: None,
    }
  }

  /// Remote to fetch missing nested-repository commits from.
  pub fn with_fetch_remote(mut self, remote: impl Into<String>) -> Self {
    self.fetch_remote = Some(remote.into());
    self
  }

  pub fn filter(&self) -> &RefFilter {
    &self.filter
  }

  /// Top-level directory of the repository containing `path`.
  pub async fn root(path: &Path) -> Result<PathBuf, DiscoveryError> {
    let args = ["rev-parse", "--show-toplevel"];
    let out = run_git(path, &args).await?;
    if !out.success() {
      debug!(stderr = %out.stderr, "rev-parse failed");
      return Err(DiscoveryError::NotARepository {
        path: path.to_path_buf(),
      });
    }
    let top = String::from_utf8_lossy(&out.stdout).trim_end_matches(['\n', '\r']).to_string();
    Ok(dunce::simplified(Path::new(&top)).to_path_buf())
  }

  /// Hash of the commit checked out at `repo`.
  pub async fn current_commit(repo: &Path) -> Result<String, DiscoveryError> {
    let args = ["rev-parse", "HEAD"];
    let out = run_git(repo, &args).await?;
    if !out.success() {
      return Err(DiscoveryError::CommandFailed {
        cmd: describe(&args),
        code: out.code,
        stderr: out.stderr,
      });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
  }

  fn copy_tree<'a>(&'a self, repo: &'a Path, object: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<(), MaterializeError>> {
    Box::pin(async move {
      archive_into(repo, object, dest).await?;

      for (path, commit) in gitlinks(repo, object).await? {
        let nested = repo.join(&path);
        if !nested.join(".git").exists() {
          warn!(path = %path, "nested repository not initialized, skipping");
          continue;
        }

        if !self.ensure_commit(&nested, &commit).await? {
          warn!(path = %path, commit = %commit, "nested commit not available, skipping");
          continue;
        }

        debug!(path = %path, commit = %commit, "copying nested repository");
        self.copy_tree(&nested, &commit, &dest.join(&path)).await?;
      }

      Ok(())
    })
  }

  /// Make sure `commit` exists in `repo`, fetching it when a fetch remote is set.
  async fn ensure_commit(&self, repo: &Path, commit: &str) -> Result<bool, MaterializeError> {
    if has_commit(repo, commit).await? {
      return Ok(true);
    }
    let Some(remote) = &self.fetch_remote else {
      return Ok(false);
    };

    info!(repo = ?repo, remote = %remote, commit = %commit, "fetching missing commit");
    let args = ["fetch", remote.as_str(), commit];
    let out = run_git(repo, &args).await?;
    if !out.success() {
      warn!(cmd = %describe(&args), stderr = %out.stderr, "fetch failed");
      return Ok(false);
    }
    has_commit(repo, commit).await
  }
}

#[async_trait]
impl RevisionProvider for GitProvider {
  async fn list_candidates(&self, root: &Path) -> Result<Vec<Revision>, DiscoveryError> {
    if !root.is_dir() {
      return Err(DiscoveryError::NotARepository {
        path: root.to_path_buf(),
      });
    }

    let args = ["for-each-ref", "--format", REF_FORMAT, "refs"];
    let out = run_git(root, &args).await?;
    if !out.success() {
      return Err(DiscoveryError::CommandFailed {
        cmd: describe(&args),
        code: out.code,
        stderr: out.stderr,
      });
    }

    Ok(String::from_utf8_lossy(&out.stdout).lines().filter_map(parse_ref).collect())
  }

  async fn passes_filter(&self, root: &Path, revision: &Revision) -> bool {
    self.filter.accepts(root, revision).await
  }

  async fn materialize(&self, root: &Path, dest: &Path, revision: &Revision) -> Result<(), MaterializeError> {
    info!(revision = %revision.name, dest = ?dest, "materializing revision");
    self.copy_tree(root, &revision.content_id, dest).await
  }
}

/// Export the tree of `object` into `dest`.
///
/// The archive is spooled to an anonymous temporary file and unpacked on a
/// blocking thread.
async fn archive_into(repo: &Path, object: &str, dest: &Path) -> Result<(), MaterializeError> {
  let spool = tempfile::tempfile()?;
  let sink = spool.try_clone()?;

  let args = ["archive", "--format", "tar", object];
  let output = git_command(repo)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::from(sink))
    .stderr(Stdio::piped())
    .output()
    .await?;
  if !output.status.success() {
    return Err(MaterializeError::CommandFailed {
      cmd: describe(&args),
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }

  tokio::fs::create_dir_all(dest).await?;

  let dest_owned = dest.to_path_buf();
  let revision = object.to_string();
  tokio::task::spawn_blocking(move || {
    let mut spool = spool;
    spool.seek(SeekFrom::Start(0))?;
    let mut archive = tar::Archive::new(spool);
    archive.set_overwrite(true);
    archive.unpack(&dest_owned)
  })
  .await
  .map_err(|e| MaterializeError::Unpack {
    revision: revision.clone(),
    message: e.to_string(),
  })?
  .map_err(|e| MaterializeError::Unpack {
    revision,
    message: e.to_string(),
  })
}

/// `(path, commit)` for every gitlink in the tree of `object`.
async fn gitlinks(repo: &Path, object: &str) -> Result<Vec<(String, String)>, MaterializeError> {
  let args = ["ls-tree", "-r", "-z", object];
  let out = run_git(repo, &args).await?;
  if !out.success() {
    return Err(MaterializeError::CommandFailed {
      cmd: describe(&args),
      code: out.code,
      stderr: out.stderr,
    });
  }
  Ok(parse_gitlinks(&String::from_utf8_lossy(&out.stdout)))
}

/// Parse `ls-tree -z` output, keeping entries of type `commit`.
pub(crate) fn parse_gitlinks(listing: &str) -> Vec<(String, String)> {
  listing
    .split('\0')
    .filter_map(|entry| {
      let (meta, path) = entry.split_once('\t')?;
      let mut fields = meta.split_whitespace();
      let (_mode, kind, object) = (fields.next()?, fields.next()?, fields.next()?);
      (kind == "commit").then(|| (path.to_string(), object.to_string()))
    })
    .collect()
}

async fn has_commit(repo: &Path, commit: &str) -> Result<bool, MaterializeError> {
  let spec = format!("{}^{{commit}}", commit);
  let out = run_git(repo, &["cat-file", "-e", &spec]).await?;
  Ok(out.success())
}

/// Whether `ancestor` is an ancestor of `descendant`.
pub async fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, DiscoveryError> {
  let args = ["merge-base", "--is-ancestor", ancestor, descendant];
  let out = run_git(repo, &args).await?;
  match out.code {
    Some(0) => Ok(true),
    Some(1) => Ok(false),
    code => Err(DiscoveryError::CommandFailed {
      cmd: describe(&args),
      code,
      stderr: out.stderr,
    }),
  }
}

/// The last of `keys` that is an ancestor of `revision`.
///
/// Keys are git references ordered from oldest to newest, so the result is the
/// closest one. Intended as a selector for per-revision builders and
/// environments.
pub async fn closest_tag(root: &Path, revision: &Revision, keys: &[String]) -> Result<Option<String>, DiscoveryError> {
  for key in keys.iter().rev() {
    if is_ancestor(root, key, &revision.content_id).await? {
      return Ok(Some(key.clone()));
    }
  }
  Ok(None)
}
