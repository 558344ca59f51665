use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared or observed type of a fact field
///
/// Range indexes are only built when both operands are numbers or share the same
/// comparable type, so the classification lives next to `FactValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// UTF-8 string
    String,
    /// Signed 64-bit integer
    Integer,
    /// 64-bit float
    Float,
    /// Boolean
    Boolean,
    /// UTC date/time
    Date,
    /// Ordered list of values
    Array,
    /// String-keyed map of values
    Object,
    /// Absent value
    Null,
}

impl ValueType {
    /// Integer and float values compare with each other
    #[must_use]
    pub const fn is_number(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether values of this type carry a total order usable by a range index
    #[must_use]
    pub const fn is_comparable(self) -> bool {
        matches!(
            self,
            Self::String | Self::Integer | Self::Float | Self::Boolean | Self::Date
        )
    }

    /// Lowercase name, as used in configuration and log records
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
