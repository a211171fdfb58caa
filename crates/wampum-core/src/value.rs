//! Dynamic payload values exchanged with the router.
//!
//! WAMP payloads (call arguments, event payloads, option dictionaries) are
//! schemaless, so they are modelled as a tagged union rather than typed
//! structs. All values are fully owned: once a message has been decoded its
//! fields are plain Rust data with no ties to the decode buffer.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// String-keyed dictionary used for options, details and keyword arguments.
pub type Dict = BTreeMap<String, Value>;

/// A dynamically typed payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(Dict),
}

/// The tag of a [`Value`], used in conversion error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

/// A fallible conversion from a [`Value`] found the wrong tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub expected: ValueKind,
    pub found: ValueKind,
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl std::error::Error for ConversionError {}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(other.mismatch(ValueKind::Bool)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ConversionError> {
        match self {
            Self::Integer(i) => Ok(*i),
            other => Err(other.mismatch(ValueKind::Integer)),
        }
    }

    /// Non-negative integer, as used for all WAMP ids.
    pub fn as_u64(&self) -> Result<u64, ConversionError> {
        match self {
            Self::Integer(i) if *i >= 0 => Ok(*i as u64),
            other => Err(other.mismatch(ValueKind::Integer)),
        }
    }

    /// Floating point value; integers widen losslessly within f64 range.
    pub fn as_f64(&self) -> Result<f64, ConversionError> {
        match self {
            Self::Float(f) => Ok(*f),
            Self::Integer(i) => Ok(*i as f64),
            other => Err(other.mismatch(ValueKind::Float)),
        }
    }

    pub fn as_str(&self) -> Result<&str, ConversionError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], ConversionError> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    pub fn as_map(&self) -> Result<&Dict, ConversionError> {
        match self {
            Self::Map(m) => Ok(m),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    fn mismatch(&self, expected: ValueKind) -> ConversionError {
        ConversionError {
            expected,
            found: self.kind(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Self::Map(v)
    }
}

/// Ordered positional-argument builder, one value at a time.
///
/// ```
/// use wampum_core::ValueList;
///
/// let args = ValueList::new().push(2).push("x").build();
/// assert_eq!(args.len(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ValueList {
    items: Vec<Value>,
}

impl ValueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.items.push(value.into());
        self
    }

    pub fn build(self) -> Vec<Value> {
        self.items
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a WAMP payload value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Integer)
            .map_err(|_| E::custom(format!("integer {v} out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = Dict::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.insert(key, value);
        }
        Ok(Value::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_check_the_tag() {
        let v = Value::Integer(7);
        assert_eq!(v.as_i64().unwrap(), 7);
        assert_eq!(v.as_u64().unwrap(), 7);
        let err = v.as_str().unwrap_err();
        assert_eq!(err.expected, ValueKind::String);
        assert_eq!(err.found, ValueKind::Integer);
    }

    #[test]
    fn negative_integer_is_not_an_id() {
        assert!(Value::Integer(-1).as_u64().is_err());
    }

    #[test]
    fn integer_widens_to_float() {
        assert_eq!(Value::Integer(3).as_f64().unwrap(), 3.0);
        assert!(Value::Float(1.5).as_i64().is_err());
    }

    #[test]
    fn list_builder_preserves_order() {
        let args = ValueList::new().push(1).push("x").push(true).build();
        assert_eq!(
            args,
            vec![Value::Integer(1), Value::String("x".into()), Value::Bool(true)]
        );
    }

    #[test]
    fn msgpack_round_trip() {
        let mut map = Dict::new();
        map.insert("k".into(), Value::Array(vec![Value::Null, Value::Bool(true)]));
        let original = Value::Array(vec![
            Value::Integer(42),
            Value::Float(2.5),
            Value::String("hello".into()),
            Value::Map(map),
        ]);

        let bytes = rmp_serde::to_vec(&original).unwrap();
        let decoded: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
