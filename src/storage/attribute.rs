//! Attribute values as stored in the table.
//!
//! `AttributeValue` serializes as plain JSON (strings, numbers, booleans,
//! arrays, objects). The DynamoDB wire form (`{"S": "..."}`, `{"N": "1"}`)
//! used by change-log payloads is handled by [`AttributeValue::from_wire`]
//! and [`AttributeValue::to_wire`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Attribute map of a stored item, ordered by attribute name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Error decoding a wire-format attribute value.
#[derive(Debug, thiserror::Error)]
#[error("malformed attribute value: {0}")]
pub struct WireError(pub String);

/// A single typed attribute value.
///
/// Numbers keep their decimal string form so that values such as versions
/// round-trip without float conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum AttributeValue {
    S(String),
    N(String),
    Bool(bool),
    Null,
    L(Vec<AttributeValue>),
    M(Attributes),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Decode a DynamoDB-JSON value such as `{"S": "abc"}`.
    ///
    /// String and number sets decode to lists. Binary values keep their
    /// base64 text as a string.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        let object = value
            .as_object()
            .ok_or_else(|| WireError(format!("expected a type descriptor object, got {value}")))?;

        let mut entries = object.iter();
        let (tag, inner) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(WireError(
                    "attribute value must carry exactly one type descriptor".to_string(),
                ))
            }
        };

        match tag.as_str() {
            "S" | "B" => Ok(Self::S(expect_str(tag, inner)?.to_string())),
            "N" => {
                let n = expect_str(tag, inner)?;
                if n.parse::<f64>().is_err() {
                    return Err(WireError(format!("N value is not numeric: {n}")));
                }
                Ok(Self::N(n.to_string()))
            }
            "BOOL" => inner
                .as_bool()
                .map(Self::Bool)
                .ok_or_else(|| WireError(format!("BOOL expects a boolean, got {inner}"))),
            "NULL" => Ok(Self::Null),
            "SS" | "BS" => Ok(Self::L(
                expect_strings(tag, inner)?
                    .into_iter()
                    .map(|s| Self::S(s.to_string()))
                    .collect(),
            )),
            "NS" => Ok(Self::L(
                expect_strings(tag, inner)?
                    .into_iter()
                    .map(|s| Self::N(s.to_string()))
                    .collect(),
            )),
            "L" => inner
                .as_array()
                .ok_or_else(|| WireError(format!("L expects an array, got {inner}")))?
                .iter()
                .map(Self::from_wire)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::L),
            "M" => attributes_from_wire(inner).map(Self::M),
            other => Err(WireError(format!("unknown type descriptor '{other}'"))),
        }
    }

    /// Encode as DynamoDB-JSON.
    pub fn to_wire(&self) -> Value {
        let (tag, inner) = match self {
            Self::S(s) => ("S", Value::String(s.clone())),
            Self::N(n) => ("N", Value::String(n.clone())),
            Self::Bool(b) => ("BOOL", Value::Bool(*b)),
            Self::Null => ("NULL", Value::Bool(true)),
            Self::L(items) => ("L", Value::Array(items.iter().map(Self::to_wire).collect())),
            Self::M(attrs) => ("M", attributes_to_wire(attrs)),
        };
        let mut object = Map::with_capacity(1);
        object.insert(tag.to_string(), inner);
        Value::Object(object)
    }
}

fn expect_str<'a>(tag: &str, value: &'a Value) -> Result<&'a str, WireError> {
    value
        .as_str()
        .ok_or_else(|| WireError(format!("{tag} expects a string, got {value}")))
}

fn expect_strings<'a>(tag: &str, value: &'a Value) -> Result<Vec<&'a str>, WireError> {
    value
        .as_array()
        .ok_or_else(|| WireError(format!("{tag} expects an array, got {value}")))?
        .iter()
        .map(|v| expect_str(tag, v))
        .collect()
}

/// Decode a DynamoDB-JSON attribute map (`{"name": {"S": "..."}}`).
pub fn attributes_from_wire(value: &Value) -> Result<Attributes, WireError> {
    value
        .as_object()
        .ok_or_else(|| WireError(format!("expected an attribute map, got {value}")))?
        .iter()
        .map(|(name, v)| Ok((name.clone(), AttributeValue::from_wire(v)?)))
        .collect()
}

/// Encode an attribute map as DynamoDB-JSON.
pub fn attributes_to_wire(attributes: &Attributes) -> Value {
    Value::Object(
        attributes
            .iter()
            .map(|(name, v)| (name.clone(), v.to_wire()))
            .collect(),
    )
}

/// Convert a plain JSON object into attributes. Non-objects yield `None`.
pub fn attributes_from_json(value: Value) -> Option<Attributes> {
    match AttributeValue::from(value) {
        AttributeValue::M(attrs) => Some(attrs),
        _ => None,
    }
}

/// Convert attributes into a plain JSON object.
pub fn attributes_to_json(attributes: &Attributes) -> Value {
    Value::from(AttributeValue::M(attributes.clone()))
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::N(n.to_string()),
            Value::String(s) => Self::S(s),
            Value::Array(items) => Self::L(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::M(
                map.into_iter()
                    .map(|(name, v)| (name, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<AttributeValue> for Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::S(s) => Value::String(s),
            AttributeValue::N(n) => match n.parse::<Number>() {
                Ok(number) => Value::Number(number),
                Err(_) => Value::String(n),
            },
            AttributeValue::Bool(b) => Value::Bool(b),
            AttributeValue::Null => Value::Null,
            AttributeValue::L(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            AttributeValue::M(attrs) => Value::Object(
                attrs
                    .into_iter()
                    .map(|(name, v)| (name, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::S(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::S(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::N(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::N(value.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
