//! Per-revision selection of builders, environments and data factories.
//!
//! A [`Selectable`] is either one value used for every revision or a keyed
//! set of options plus a selector that picks a key for each revision.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use crate::provider::git::closest_tag;
use crate::revision::Revision;

/// Picks one of the option keys for a revision. `None` means no key applies.
pub type Selector = Arc<dyn Fn(&Revision, &[String]) -> BoxFuture<'static, Option<String>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SelectError {
  #[error("no option selected for revision '{revision}'")]
  NoMatch { revision: String },

  #[error("selector returned unknown key '{key}' for revision '{revision}'")]
  UnknownKey { revision: String, key: String },
}

/// One value, or a keyed choice resolved per revision.
pub enum Selectable<T> {
  Fixed(T),
  Selected {
    selector: Selector,
    /// Options in insertion order.
    options: Vec<(String, T)>,
  },
}

impl<T> Selectable<T> {
  pub fn fixed(value: T) -> Self {
    Selectable::Fixed(value)
  }

  pub fn selected<K, I>(selector: Selector, options: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, T)>,
  {
    Selectable::Selected {
      selector,
      options: options.into_iter().map(|(k, v)| (k.into(), v)).collect(),
    }
  }

  /// Option keys in insertion order; empty for a fixed value.
  pub fn keys(&self) -> Vec<String> {
    match self {
      Selectable::Fixed(_) => Vec::new(),
      Selectable::Selected { options, .. } => options.iter().map(|(k, _)| k.clone()).collect(),
    }
  }

  /// The value to use for `revision`.
  pub async fn resolve(&self, revision: &Revision) -> Result<&T, SelectError> {
    let (selector, options) = match self {
      Selectable::Fixed(value) => return Ok(value),
      Selectable::Selected { selector, options } => (selector, options),
    };

    let keys = self.keys();
    let key = selector(revision, &keys).await.ok_or_else(|| SelectError::NoMatch {
      revision: revision.name.clone(),
    })?;
    debug!(revision = %revision.name, key = %key, "selected option");

    options
      .iter()
      .find(|(k, _)| *k == key)
      .map(|(_, value)| value)
      .ok_or_else(|| SelectError::UnknownKey {
        revision: revision.name.clone(),
        key,
      })
  }
}

impl<T: Clone> Clone for Selectable<T> {
  fn clone(&self) -> Self {
    match self {
      Selectable::Fixed(value) => Selectable::Fixed(value.clone()),
      Selectable::Selected { selector, options } => Selectable::Selected {
        selector: selector.clone(),
        options: options.clone(),
      },
    }
  }
}

impl<T> fmt::Debug for Selectable<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Selectable::Fixed(_) => f.write_str("Fixed(..)"),
      Selectable::Selected { .. } => f.debug_struct("Selected").field("keys", &self.keys()).finish(),
    }
  }
}

impl<T> From<T> for Selectable<T> {
  fn from(value: T) -> Self {
    Selectable::Fixed(value)
  }
}

/// Selects the last key, in option order, naming a tag that is an ancestor of
/// the revision in the repository at `root`.
///
/// Order the options oldest tag first. Git failures are logged and treated as
/// no match.
pub fn closest_tag_selector(root: impl Into<PathBuf>) -> Selector {
  let root = root.into();
  Arc::new(move |revision: &Revision, keys: &[String]| -> BoxFuture<'static, Option<String>> {
    let root = root.clone();
    let revision = revision.clone();
    let keys = keys.to_vec();
    async move {
      match closest_tag(&root, &revision, &keys).await {
        Ok(key) => key,
        Err(e) => {
          warn!(revision = %revision.name, error = %e, "failed to determine closest tag");
          None
        }
      }
    }
    .boxed()
  })
}

/// Selects the key equal to the revision name, falling back to `default`.
pub fn name_selector(default: Option<String>) -> Selector {
  Arc::new(move |revision: &Revision, keys: &[String]| -> BoxFuture<'static, Option<String>> {
    let key = if keys.contains(&revision.name) {
      Some(revision.name.clone())
    } else {
      default.clone()
    };
    futures::future::ready(key).boxed()
  })
}
