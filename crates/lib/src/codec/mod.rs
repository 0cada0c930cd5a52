//! Metadata codec.
//!
//! Encodes [`Value`] trees to JSON text and back. Extension objects are written
//! as single-key wire mappings:
//!
//! ```text
//! {"__jsonclass__": ["<type id>", <fields>]}   // a registered JsonClass
//! {"__jsonhook__":  ["<hook id>", <fields>]}   // a value handled by a JsonHook
//! ```
//!
//! Decoding works bottom-up: nested fields are decoded before the enclosing
//! object is reconstructed. A payload naming an identifier that is not
//! registered is returned as the raw wire mapping instead of failing, so
//! metadata written by newer or foreign tools still loads.

mod hooks;
mod value;

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::revision::{Revision, RevisionKind};

pub use hooks::DateTimeHook;
pub use value::{Extension, Object, Value};

/// Wire key marking an encoded [`JsonClass`] instance.
pub const CLASS_KEY: &str = "__jsonclass__";

/// Wire key marking a value encoded through a [`JsonHook`].
pub const HOOK_KEY: &str = "__jsonhook__";

/// Errors that can occur while encoding or decoding metadata.
#[derive(Debug, Error)]
pub enum CodecError {
  /// An object with no registered class or hook was encountered while encoding.
  #[error("no class or hook registered for object {0}")]
  Unregistered(String),

  /// The identifier is already taken by another class or hook.
  #[error("'{0}' is already registered")]
  AlreadyRegistered(String),

  /// A registered class or hook rejected the decoded fields.
  #[error("invalid fields for '{id}': {message}")]
  InvalidFields { id: String, message: String },

  /// The text is not valid JSON.
  #[error("malformed json: {0}")]
  Json(#[from] serde_json::Error),
}

impl CodecError {
  pub fn invalid_fields(id: &str, message: impl Into<String>) -> Self {
    CodecError::InvalidFields {
      id: id.to_string(),
      message: message.into(),
    }
  }
}

/// A type that knows how to convert itself to and from codec fields.
///
/// `Serialize` provides the plain view used for template contexts.
pub trait JsonClass: Extension + Serialize + Sized {
  /// Unique identifier written to the wire.
  const CLASS: &'static str;

  /// Representation of the instance's state; must itself be encodable.
  fn to_fields(&self) -> Value;

  /// Rebuild an instance from already decoded fields.
  fn from_fields(fields: &Value) -> Result<Self, CodecError>;
}

/// Encoding support for types that cannot implement [`JsonClass`] themselves.
pub trait JsonHook: Send + Sync {
  /// Unique identifier written to the wire.
  fn id(&self) -> &str;

  /// Fields for `value`, or `None` when the hook does not handle its type.
  fn fields(&self, value: &dyn Any) -> Option<Value>;

  /// Rebuild a value from already decoded fields.
  fn from_fields(&self, fields: &Value) -> Result<Value, CodecError>;

  /// Plain JSON view of `value` for template contexts.
  fn plain(&self, value: &dyn Any) -> Option<serde_json::Value>;
}

#[derive(Clone)]
struct ClassEntry {
  id: &'static str,
  encode: fn(&dyn Any) -> Option<Value>,
  decode: fn(&Value) -> Result<Value, CodecError>,
  plain: fn(&dyn Any) -> Option<serde_json::Value>,
}

fn encode_class<T: JsonClass>(value: &dyn Any) -> Option<Value> {
  value.downcast_ref::<T>().map(T::to_fields)
}

fn decode_class<T: JsonClass>(fields: &Value) -> Result<Value, CodecError> {
  T::from_fields(fields).map(Value::object)
}

fn plain_class<T: JsonClass>(value: &dyn Any) -> Option<serde_json::Value> {
  value.downcast_ref::<T>().and_then(|v| serde_json::to_value(v).ok())
}

/// JSON encoder/decoder with a registry of extension types.
#[derive(Clone, Default)]
pub struct Codec {
  classes: HashMap<TypeId, ClassEntry>,
  class_ids: HashMap<String, TypeId>,
  hooks: Vec<Arc<dyn JsonHook>>,
}

static GLOBAL: LazyLock<Codec> = LazyLock::new(Codec::standard);

impl fmt::Debug for Codec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut classes: Vec<_> = self.class_ids.keys().collect();
    classes.sort();
    let hooks: Vec<_> = self.hooks.iter().map(|h| h.id()).collect();
    f.debug_struct("Codec").field("classes", &classes).field("hooks", &hooks).finish()
  }
}

impl Codec {
  /// An empty codec that only understands plain JSON values.
  pub fn new() -> Self {
    Self::default()
  }

  /// A codec with the revision types and the datetime hook registered.
  pub fn standard() -> Self {
    let mut codec = Self::new();
    codec.insert_class::<RevisionKind>();
    codec.insert_class::<Revision>();
    codec.hooks.push(Arc::new(DateTimeHook));
    codec
  }

  /// Shared standard codec.
  pub fn global() -> &'static Codec {
    &GLOBAL
  }

  fn insert_class<T: JsonClass>(&mut self) {
    let type_id = TypeId::of::<T>();
    self.class_ids.insert(T::CLASS.to_string(), type_id);
    self.classes.insert(
      type_id,
      ClassEntry {
        id: T::CLASS,
        encode: encode_class::<T>,
        decode: decode_class::<T>,
        plain: plain_class::<T>,
      },
    );
  }

  fn is_taken(&self, id: &str) -> bool {
    self.class_ids.contains_key(id) || self.hooks.iter().any(|h| h.id() == id)
  }

  /// Register a [`JsonClass`] type.
  pub fn register_class<T: JsonClass>(&mut self) -> Result<&mut Self, CodecError> {
    if self.is_taken(T::CLASS) || self.classes.contains_key(&TypeId::of::<T>()) {
      return Err(CodecError::AlreadyRegistered(T::CLASS.to_string()));
    }
    self.insert_class::<T>();
    Ok(self)
  }

  /// Register a [`JsonHook`].
  pub fn register_hook(&mut self, hook: impl JsonHook + 'static) -> Result<&mut Self, CodecError> {
    if self.is_taken(hook.id()) {
      return Err(CodecError::AlreadyRegistered(hook.id().to_string()));
    }
    self.hooks.push(Arc::new(hook));
    Ok(self)
  }

  /// Register every class and hook known to `other` that is not known here yet.
  pub fn merge(&mut self, other: &Codec) {
    for (id, type_id) in &other.class_ids {
      if self.is_taken(id) {
        continue;
      }
      if let Some(entry) = other.classes.get(type_id) {
        self.class_ids.insert(id.clone(), *type_id);
        self.classes.insert(*type_id, entry.clone());
      }
    }
    for hook in &other.hooks {
      if !self.is_taken(hook.id()) {
        self.hooks.push(hook.clone());
      }
    }
  }

  /// Identifiers of all registered classes and hooks.
  pub fn registered(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.class_ids.keys().cloned().collect();
    ids.extend(self.hooks.iter().map(|h| h.id().to_string()));
    ids.sort();
    ids
  }

  /// Encode a value to JSON text.
  pub fn encode(&self, value: &Value) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&self.to_wire(value)?)?)
  }

  /// Encode a value to pretty-printed JSON text.
  pub fn encode_pretty(&self, value: &Value) -> Result<String, CodecError> {
    Ok(serde_json::to_string_pretty(&self.to_wire(value)?)?)
  }

  /// Replace extension objects by their wire mappings.
  pub fn to_wire(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
    Ok(match value {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Number(n) => serde_json::Value::Number(n.clone()),
      Value::String(s) => serde_json::Value::String(s.clone()),
      Value::Seq(items) => serde_json::Value::Array(items.iter().map(|v| self.to_wire(v)).collect::<Result<_, _>>()?),
      Value::Map(map) => serde_json::Value::Object(
        map
          .iter()
          .map(|(k, v)| Ok((k.clone(), self.to_wire(v)?)))
          .collect::<Result<_, CodecError>>()?,
      ),
      Value::Object(obj) => self.object_to_wire(obj)?,
    })
  }

  fn object_to_wire(&self, obj: &Object) -> Result<serde_json::Value, CodecError> {
    let any = obj.as_any();

    // hooks take precedence so foreign types can be handled without a class
    for hook in &self.hooks {
      if let Some(fields) = hook.fields(any) {
        return Ok(tagged(HOOK_KEY, hook.id(), self.to_wire(&fields)?));
      }
    }

    if let Some(entry) = self.classes.get(&obj.type_id()) {
      if let Some(fields) = (entry.encode)(any) {
        return Ok(tagged(CLASS_KEY, entry.id, self.to_wire(&fields)?));
      }
    }

    Err(CodecError::Unregistered(format!("{:?}", obj)))
  }

  /// Decode JSON text into a value.
  pub fn decode(&self, text: &str) -> Result<Value, CodecError> {
    let wire: serde_json::Value = serde_json::from_str(text)?;
    self.from_wire(wire)
  }

  /// Rebuild a value from its wire representation.
  pub fn from_wire(&self, wire: serde_json::Value) -> Result<Value, CodecError> {
    Ok(match wire {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => Value::Number(n),
      serde_json::Value::String(s) => Value::String(s),
      serde_json::Value::Array(items) => {
        Value::Seq(items.into_iter().map(|v| self.from_wire(v)).collect::<Result<_, _>>()?)
      }
      serde_json::Value::Object(map) => {
        let decoded: BTreeMap<String, Value> = map
          .into_iter()
          .map(|(k, v)| Ok((k, self.from_wire(v)?)))
          .collect::<Result<_, CodecError>>()?;
        self.revive(decoded)?
      }
    })
  }

  /// Turn an already decoded mapping into an object when it is a known payload.
  fn revive(&self, map: BTreeMap<String, Value>) -> Result<Value, CodecError> {
    let Some((key, id, fields)) = payload(&map) else {
      return Ok(Value::Map(map));
    };

    match key {
      CLASS_KEY => {
        if let Some(entry) = self.class_ids.get(id).and_then(|t| self.classes.get(t)) {
          return (entry.decode)(fields);
        }
      }
      _ => {
        if let Some(hook) = self.hooks.iter().find(|h| h.id() == id) {
          return hook.from_fields(fields);
        }
      }
    }

    debug!(id, "no class or hook registered, keeping raw payload");
    Ok(Value::Map(map))
  }

  /// Plain JSON view of a value: classes become their serde representation,
  /// hooked values their hook's plain form. Used as template context.
  pub fn to_plain(&self, value: &Value) -> serde_json::Value {
    match value {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Number(n) => serde_json::Value::Number(n.clone()),
      Value::String(s) => serde_json::Value::String(s.clone()),
      Value::Seq(items) => serde_json::Value::Array(items.iter().map(|v| self.to_plain(v)).collect()),
      Value::Map(map) => serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), self.to_plain(v))).collect()),
      Value::Object(obj) => {
        let any = obj.as_any();
        if let Some(plain) = self.hooks.iter().find_map(|h| h.plain(any)) {
          return plain;
        }
        if let Some(plain) = self.classes.get(&obj.type_id()).and_then(|e| (e.plain)(any)) {
          return plain;
        }
        warn!(object = ?obj, "object has no plain representation");
        serde_json::Value::Null
      }
    }
  }
}

fn tagged(key: &str, id: &str, fields: serde_json::Value) -> serde_json::Value {
  let mut map = serde_json::Map::new();
  map.insert(
    key.to_string(),
    serde_json::Value::Array(vec![serde_json::Value::String(id.to_string()), fields]),
  );
  serde_json::Value::Object(map)
}

/// Split a single-key wire mapping into `(marker, id, fields)`.
fn payload(map: &BTreeMap<String, Value>) -> Option<(&'static str, &str, &Value)> {
  if map.len() != 1 {
    return None;
  }
  let (key, body) = map.iter().next()?;
  let key = match key.as_str() {
    CLASS_KEY => CLASS_KEY,
    HOOK_KEY => HOOK_KEY,
    _ => return None,
  };
  match body.as_seq()? {
    [Value::String(id), fields] => Some((key, id.as_str(), fields)),
    _ => None,
  }
}
