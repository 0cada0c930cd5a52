//! The metadata value model.
//!
//! A [`Value`] is a JSON-like tree: scalars, ordered sequences, string-keyed
//! mappings and opaque [`Object`]s. Objects hold instances of registered
//! extension types (revisions, timestamps, ...) and are turned into wire
//! payloads by the [`Codec`](super::Codec).

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A type that can live inside a [`Value::Object`].
///
/// Blanket-implemented for every `'static` type that is `Debug + PartialEq +
/// Send + Sync`, so extension types only need the usual derives.
pub trait Extension: Any + fmt::Debug + Send + Sync {
  fn as_any(&self) -> &dyn Any;

  fn dyn_eq(&self, other: &dyn Extension) -> bool;
}

impl<T> Extension for T
where
  T: Any + fmt::Debug + PartialEq + Send + Sync,
{
  fn as_any(&self) -> &dyn Any {
    self
  }

  fn dyn_eq(&self, other: &dyn Extension) -> bool {
    other.as_any().downcast_ref::<T>().is_some_and(|other| self == other)
  }
}

/// A shared, type-erased extension value.
#[derive(Clone)]
pub struct Object(Arc<dyn Extension>);

impl Object {
  pub fn new<T: Extension>(value: T) -> Self {
    Self(Arc::new(value))
  }

  /// The [`TypeId`] of the wrapped concrete value.
  pub fn type_id(&self) -> TypeId {
    self.as_any().type_id()
  }

  pub fn as_any(&self) -> &dyn Any {
    (*self.0).as_any()
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    self.as_any().downcast_ref::<T>()
  }

  pub fn is<T: Any>(&self) -> bool {
    self.as_any().is::<T>()
  }
}

impl PartialEq for Object {
  fn eq(&self, other: &Self) -> bool {
    (*self.0).dyn_eq(&*other.0)
  }
}

impl fmt::Debug for Object {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

/// A metadata value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Number(serde_json::Number),
  String(String),
  Seq(Vec<Value>),
  Map(BTreeMap<String, Value>),
  Object(Object),
}

impl Value {
  /// Wrap an extension instance.
  pub fn object<T: Extension>(value: T) -> Self {
    Value::Object(Object::new(value))
  }

  /// Build a mapping from `(key, value)` pairs.
  pub fn map<K, I>(entries: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
  {
    Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Number(n) => n.as_i64(),
      _ => None,
    }
  }

  pub fn as_seq(&self) -> Option<&[Value]> {
    match self {
      Value::Seq(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
    match self {
      Value::Map(map) => Some(map),
      _ => None,
    }
  }

  /// Look up a key when this value is a mapping.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_map().and_then(|map| map.get(key))
  }

  /// Borrow the wrapped extension instance if it is a `T`.
  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    match self {
      Value::Object(obj) => obj.downcast_ref::<T>(),
      _ => None,
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self {
    Value::Number(n.into())
  }
}

impl From<u64> for Value {
  fn from(n: u64) -> Self {
    Value::Number(n.into())
  }
}

impl From<f64> for Value {
  /// Non-finite floats have no JSON representation and become `Null`.
  fn from(n: f64) -> Self {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(opt: Option<T>) -> Self {
    opt.map_or(Value::Null, Into::into)
  }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
  fn from(items: Vec<T>) -> Self {
    Value::Seq(items.into_iter().map(Into::into).collect())
  }
}

impl From<BTreeMap<String, Value>> for Value {
  fn from(map: BTreeMap<String, Value>) -> Self {
    Value::Map(map)
  }
}

impl<T: Into<Value>> FromIterator<T> for Value {
  fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
    Value::Seq(iter.into_iter().map(Into::into).collect())
  }
}
