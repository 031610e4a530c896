use crate::core::{Result, StateError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The full attribute set of one entity.
///
/// Values are arbitrary JSON (`serde_json::Value` is the tagged union of
/// null/bool/number/string/array/object). Typed access goes through
/// [`Document::get_as`], which reports values that do not fit the requested
/// type as [`StateError::TypeMismatch`] instead of guessing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    attributes: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(attributes) => Ok(Self { attributes }),
            other => Err(StateError::DecodeError(format!(
                "expected a JSON object, found {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.attributes)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attributes.iter()
    }

    /// Reads `key` as `T`. `Ok(None)` when the key is absent.
    ///
    /// A stored scalar that does not deserialize as-is gets one more try
    /// through the explicit coercions (integral floats and numeric strings as
    /// integers, numeric strings as floats, `"true"`/`"false"` as booleans).
    /// Only values no coercion can fit are a `TypeMismatch`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.attributes.get(key) else {
            return Ok(None);
        };
        T::deserialize(value)
            .or_else(|err| {
                coercions(value)
                    .find_map(|candidate| T::deserialize(&candidate).ok())
                    .ok_or(err)
            })
            .map(Some)
            .map_err(|err| {
                StateError::TypeMismatch(format!(
                    "attribute '{}' holds {} ({}): {}",
                    key,
                    json_type_name(value),
                    value,
                    err
                ))
            })
    }
}

impl From<Map<String, Value>> for Document {
    fn from(attributes: Map<String, Value>) -> Self {
        Self { attributes }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Alternative readings of a scalar, most specific first.
fn coercions(value: &Value) -> impl Iterator<Item = Value> {
    [
        coerce_i64(value).map(Value::from),
        coerce_f64(value).map(Value::from),
        coerce_bool(value).map(Value::Bool),
    ]
    .into_iter()
    .flatten()
    .filter(move |candidate| candidate != value)
}

/// Integers, integral floats and numeric strings.
fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
