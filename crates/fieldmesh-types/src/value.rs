//! Structurally-typed message payloads.

use crate::array::{NdArray, PackedArray};
use crate::error::MessageResult;
use std::collections::BTreeMap;
use std::fmt;

/// Tag wrapping a float the textual form cannot hold as a number.
pub const FLOAT_TAG: &str = "FLOAT";

/// A message payload.
///
/// The messaging layer never interprets a value; it only moves it between
/// the textual envelope and native types. Arrays appear either decoded
/// ([`Value::Array`]) or still packed ([`Value::Packed`]) depending on
/// whether the receiver asked for expansion.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Array(NdArray),
    Packed(PackedArray),
}

impl Value {
    /// Convert to the textual form, packing every array.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => J::Number(n),
                None => serde_json::json!({ FLOAT_TAG: non_finite_name(*f) }),
            },
            Value::Str(s) => J::String(s.clone()),
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => J::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Array(arr) => arr.pack().to_json(),
            Value::Packed(packed) => packed.to_json(),
        }
    }

    /// Convert from the textual form.
    ///
    /// Tagged array objects become [`Value::Array`] when `expand_arrays` is
    /// set and stay [`Value::Packed`] otherwise.
    pub fn from_json(json: serde_json::Value, expand_arrays: bool) -> MessageResult<Self> {
        use serde_json::Value as J;
        let value = match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => Value::Str(s),
            J::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| Value::from_json(item, expand_arrays))
                    .collect::<MessageResult<_>>()?,
            ),
            J::Object(object) => {
                if let Some(f) = non_finite_from_json(&object) {
                    Value::Float(f)
                } else {
                    match PackedArray::from_json(&object) {
                        Some(packed) if expand_arrays => Value::Array(packed.unpack()?),
                        Some(packed) => Value::Packed(packed),
                        None => Value::Map(
                            object
                                .into_iter()
                                .map(|(k, v)| Value::from_json(v, expand_arrays).map(|v| (k, v)))
                                .collect::<MessageResult<_>>()?,
                        ),
                    }
                }
            }
        };
        Ok(value)
    }

    /// Decode every packed array in place.
    pub fn expand(&mut self) -> MessageResult<()> {
        match self {
            Value::Packed(packed) => *self = Value::Array(packed.unpack()?),
            Value::List(items) => {
                for item in items {
                    item.expand()?;
                }
            }
            Value::Map(map) => {
                for item in map.values_mut() {
                    item.expand()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Look up a field of a map value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(field),
            _ => None,
        }
    }

    /// Build a map value from `(field, value)` pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

fn non_finite_name(f: f64) -> &'static str {
    if f.is_nan() {
        "nan"
    } else if f.is_sign_positive() {
        "inf"
    } else {
        "-inf"
    }
}

fn non_finite_from_json(object: &serde_json::Map<String, serde_json::Value>) -> Option<f64> {
    if object.len() != 1 {
        return None;
    }
    match object.get(FLOAT_TAG)?.as_str()? {
        "nan" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

impl fmt::Display for Value {
    /// Log-friendly rendering: arrays are summarised, never dumped.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Array(arr) => write!(f, "<{} {:?}>", arr.dtype().name(), arr.shape()),
            Value::Packed(p) => write!(f, "<packed {} {:?}>", p.dtype, p.shape),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
