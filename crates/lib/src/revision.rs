//! Revision identity and ordering.
//!
//! A [`Revision`] is one buildable point in history: a tag or a branch with the
//! object it points to and the time it was created. Revisions order by their
//! creation time only; two distinct revisions created at the same instant are
//! incomparable.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, JsonClass, Value};

/// The kind of reference a revision was discovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum RevisionKind {
  Tag,
  Branch,
}

impl RevisionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      RevisionKind::Tag => "TAG",
      RevisionKind::Branch => "BRANCH",
    }
  }

  /// Parse a wire name, case-insensitively.
  pub fn parse(name: &str) -> Option<Self> {
    match name.to_ascii_uppercase().as_str() {
      "TAG" => Some(RevisionKind::Tag),
      "BRANCH" => Some(RevisionKind::Branch),
      _ => None,
    }
  }

  /// Accept either a decoded `RevisionKind` object or its wire name.
  fn from_value(value: &Value) -> Result<Self, CodecError> {
    if let Some(kind) = value.downcast_ref::<RevisionKind>() {
      return Ok(*kind);
    }
    value
      .as_str()
      .and_then(Self::parse)
      .ok_or_else(|| CodecError::invalid_fields(Revision::CLASS, format!("invalid kind {:?}", value)))
  }
}

impl fmt::Display for RevisionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl JsonClass for RevisionKind {
  const CLASS: &'static str = "polyversion.RevisionKind";

  fn to_fields(&self) -> Value {
    Value::from(self.as_str())
  }

  fn from_fields(fields: &Value) -> Result<Self, CodecError> {
    fields
      .as_str()
      .and_then(Self::parse)
      .ok_or_else(|| CodecError::invalid_fields(Self::CLASS, format!("unknown kind {:?}", fields)))
  }
}

/// One buildable point in history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
  /// Display name, also used for the output directory (tag or branch name).
  pub name: String,
  /// Identifier of the file-tree snapshot (commit hash).
  pub content_id: String,
  /// Provider-specific locator (full ref name).
  pub origin_ref: String,
  pub kind: RevisionKind,
  pub created_at: DateTime<FixedOffset>,
  /// Remote the revision was discovered on, `None` for local refs.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub origin_name: Option<String>,
}

impl Revision {
  pub fn new(
    name: impl Into<String>,
    content_id: impl Into<String>,
    origin_ref: impl Into<String>,
    kind: RevisionKind,
    created_at: DateTime<FixedOffset>,
  ) -> Self {
    Self {
      name: name.into(),
      content_id: content_id.into(),
      origin_ref: origin_ref.into(),
      kind,
      created_at,
      origin_name: None,
    }
  }

  pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
    self.origin_name = Some(origin.into());
    self
  }

  pub fn is_tag(&self) -> bool {
    self.kind == RevisionKind::Tag
  }

  pub fn is_branch(&self) -> bool {
    self.kind == RevisionKind::Branch
  }

  /// Compare by creation time only.
  pub fn cmp_created(&self, other: &Self) -> Ordering {
    self.created_at.cmp(&other.created_at)
  }
}

impl PartialOrd for Revision {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    match self.cmp_created(other) {
      Ordering::Equal if self != other => None,
      ordering => Some(ordering),
    }
  }
}

impl fmt::Display for Revision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

impl JsonClass for Revision {
  const CLASS: &'static str = "polyversion.Revision";

  fn to_fields(&self) -> Value {
    Value::Seq(vec![
      Value::from(self.name.as_str()),
      Value::from(self.content_id.as_str()),
      Value::from(self.origin_ref.as_str()),
      Value::object(self.kind),
      Value::object(self.created_at),
      Value::from(self.origin_name.clone()),
    ])
  }

  fn from_fields(fields: &Value) -> Result<Self, CodecError> {
    let Some([name, content_id, origin_ref, kind, created_at, rest @ ..]) = fields.as_seq() else {
      return Err(CodecError::invalid_fields(
        Self::CLASS,
        "expected [name, content_id, origin_ref, kind, created_at, origin_name?]",
      ));
    };

    let origin_name = match rest.first() {
      None | Some(Value::Null) => None,
      Some(value) => Some(text_field(value, "origin_name")?),
    };

    Ok(Self {
      name: text_field(name, "name")?,
      content_id: text_field(content_id, "content_id")?,
      origin_ref: text_field(origin_ref, "origin_ref")?,
      kind: RevisionKind::from_value(kind)?,
      created_at: timestamp_field(created_at)?,
      origin_name,
    })
  }
}

impl From<Revision> for Value {
  fn from(revision: Revision) -> Self {
    Value::object(revision)
  }
}

fn text_field(value: &Value, field: &str) -> Result<String, CodecError> {
  value
    .as_str()
    .map(str::to_string)
    .ok_or_else(|| CodecError::invalid_fields(Revision::CLASS, format!("{} must be a string", field)))
}

fn timestamp_field(value: &Value) -> Result<DateTime<FixedOffset>, CodecError> {
  if let Some(ts) = value.downcast_ref::<DateTime<FixedOffset>>() {
    return Ok(*ts);
  }
  let text = value
    .as_str()
    .ok_or_else(|| CodecError::invalid_fields(Revision::CLASS, "created_at must be a timestamp"))?;
  DateTime::parse_from_rfc3339(text).map_err(|e| CodecError::invalid_fields(Revision::CLASS, e.to_string()))
}

/// Partition revisions into `(branches, tags)`, preserving relative order.
pub fn by_kind<'a, I>(revisions: I) -> (Vec<Revision>, Vec<Revision>)
where
  I: IntoIterator<Item = &'a Revision>,
{
  revisions.into_iter().cloned().partition(Revision::is_branch)
}

/// The most recently created revision.
pub fn latest(revisions: &[Revision]) -> Option<&Revision> {
  revisions.iter().max_by(|a, b| a.cmp_created(b))
}

/// Sort revisions by creation time (stable for ties).
pub fn sort_by_created(revisions: &mut [Revision]) {
  revisions.sort_by(Revision::cmp_created);
}
