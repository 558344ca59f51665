use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::value_type::ValueType;

/// A single field value carried by a fact
///
/// Equality is structural with two float rules: `0.0 == -0.0`, and every NaN
/// equals every other NaN, so equality is reflexive and hashing agrees with it.
/// Ordering is only defined between values of the same comparable type, except
/// that integers and floats order against each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FactValue {
    /// UTF-8 text
    String(String),
    /// Signed 64-bit integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// Boolean flag
    Boolean(bool),
    /// Ordered list
    Array(Vec<FactValue>),
    /// String-keyed map
    Object(HashMap<String, FactValue>),
    /// UTC instant
    Date(DateTime<Utc>),
    /// Absent value
    Null,
}

impl TryFrom<&serde_json::Value> for FactValue {
    type Error = anyhow::Error;

    /// JSON strings stay strings; dates are not sniffed out of them.
    fn try_from(json: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;

        let value = match json {
            Json::Null => Self::Null,
            Json::Bool(flag) => Self::Boolean(*flag),
            Json::String(text) => Self::String(text.clone()),
            Json::Number(number) => match (number.as_i64(), number.as_f64()) {
                (Some(integer), _) => Self::Integer(integer),
                (None, Some(float)) => Self::Float(float),
                (None, None) => bail!("number {number} does not fit a fact value"),
            },
            Json::Array(items) => Self::Array(items.iter().map(Self::try_from).collect::<Result<_>>()?),
            Json::Object(entries) => Self::Object(
                entries
                    .iter()
                    .map(|(key, item)| -> Result<(String, Self)> { Ok((key.clone(), Self::try_from(item)?)) })
                    .collect::<Result<_>>()?,
            ),
        };
        Ok(value)
    }
}

impl PartialEq for FactValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => canonical_float(*a).to_bits() == canonical_float(*b).to_bits(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl Eq for FactValue {}

impl Hash for FactValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::String(text) => text.hash(state),
            Self::Integer(integer) => integer.hash(state),
            Self::Float(float) => canonical_float(*float).to_bits().hash(state),
            Self::Boolean(flag) => flag.hash(state),
            Self::Array(items) => items.hash(state),
            Self::Object(entries) => {
                // HashMap iteration order is unstable
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                for key in keys {
                    key.hash(state);
                    entries[key].hash(state);
                }
            }
            Self::Date(instant) => instant.timestamp_nanos_opt().unwrap_or_default().hash(state),
            Self::Null => {}
        }
    }
}

impl PartialOrd for FactValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a.partial_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.partial_cmp(b),
            (Self::Date(a), Self::Date(b)) => a.partial_cmp(b),
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(b),
            (Self::Float(a), Self::Float(b)) if a.is_nan() && b.is_nan() => Some(Ordering::Equal),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

/// Collapse `-0.0` onto `0.0` and every NaN onto one quiet NaN.
///
/// Two floats are equal as fact values exactly when their canonical bits are equal.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn canonical_float(value: f64) -> f64 {
    if value.is_nan() {
        f64::NAN
    } else if value == 0.0 {
        0.0
    } else {
        value
    }
}

impl FactValue {
    /// Classify this value for index and operand compatibility checks
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Integer(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Array(_) => ValueType::Array,
            Self::Object(_) => ValueType::Object,
            Self::Date(_) => ValueType::Date,
            Self::Null => ValueType::Null,
        }
    }

    /// Numeric view of `Integer` and `Float` values; `None` for every other variant.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}
