//! Standard hooks shipped with the codec.

use std::any::Any;

use chrono::{DateTime, FixedOffset};

use super::{CodecError, JsonHook, Value};

/// Encodes `chrono::DateTime<FixedOffset>` as RFC 3339 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTimeHook;

impl DateTimeHook {
  pub const ID: &'static str = "polyversion.datetime";
}

impl JsonHook for DateTimeHook {
  fn id(&self) -> &str {
    Self::ID
  }

  fn fields(&self, value: &dyn Any) -> Option<Value> {
    value
      .downcast_ref::<DateTime<FixedOffset>>()
      .map(|ts| Value::String(ts.to_rfc3339()))
  }

  fn from_fields(&self, fields: &Value) -> Result<Value, CodecError> {
    let text = fields
      .as_str()
      .ok_or_else(|| CodecError::invalid_fields(Self::ID, "expected a string"))?;
    DateTime::parse_from_rfc3339(text)
      .map(Value::object)
      .map_err(|e| CodecError::invalid_fields(Self::ID, e.to_string()))
  }

  fn plain(&self, value: &dyn Any) -> Option<serde_json::Value> {
    value
      .downcast_ref::<DateTime<FixedOffset>>()
      .map(|ts| serde_json::Value::String(ts.to_rfc3339()))
  }
}
