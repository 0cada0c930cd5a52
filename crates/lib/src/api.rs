//! Helpers for code running inside a build.
//!
//! The driver passes each build its metadata through the
//! [`DATA_ENV_VAR`] variable. Generator-side integrations call [`load`] to
//! read it back.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

use crate::codec::{Codec, CodecError, Value};

pub use crate::builder::DATA_ENV_VAR;

#[derive(Debug, Error)]
pub enum LoadError {
  /// The metadata variable is unset or empty.
  #[error("environment variable {0} isn't set")]
  Missing(&'static str),

  #[error("invalid metadata: {0}")]
  Codec(#[from] CodecError),
}

/// Decode the metadata of the current build with the shared codec.
pub fn load() -> Result<Value, LoadError> {
  load_with(Codec::global())
}

/// Decode the metadata of the current build with `codec`.
pub fn load_with(codec: &Codec) -> Result<Value, LoadError> {
  let text = std::env::var(DATA_ENV_VAR).unwrap_or_default();
  if text.is_empty() {
    return Err(LoadError::Missing(DATA_ENV_VAR));
  }
  Ok(codec.decode(&text)?)
}

/// Template variables for the loaded metadata.
///
/// A mapping is used as is; any other value is made available as `data`.
pub fn template_context(data: Value) -> BTreeMap<String, Value> {
  match data {
    Value::Map(map) => map,
    other => BTreeMap::from([("data".to_string(), other)]),
  }
}

/// The capture groups of `format` matching the whole of `name`, for use as a
/// sort key. Groups that did not participate are empty. `None` when `name`
/// does not match.
pub fn order_versions(name: &str, format: &Regex) -> Option<Vec<String>> {
  let anchored = Regex::new(&format!("^(?:{})$", format.as_str())).ok()?;
  let caps = anchored.captures(name)?;
  Some(
    caps
      .iter()
      .skip(1)
      .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
      .collect(),
  )
}
