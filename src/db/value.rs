//! Database values and the closed set of supported column types.
//!
//! Every engine converts its native cells into [`Value`] and describes its
//! columns with a [`SqlType`]. Both enums are closed: an engine type with no
//! `SqlType` counterpart is reported as an explicit error by the engine
//! adapter instead of falling through to a default branch.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column and parameter types understood by the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Decimal,
    String,
    DateTime,
    Guid,
    Binary,
}

impl SqlType {
    /// Every variant, in declaration order.
    pub const ALL: [SqlType; 12] = [
        SqlType::Bool,
        SqlType::Byte,
        SqlType::Int16,
        SqlType::Int32,
        SqlType::Int64,
        SqlType::Float,
        SqlType::Double,
        SqlType::Decimal,
        SqlType::String,
        SqlType::DateTime,
        SqlType::Guid,
        SqlType::Binary,
    ];

    /// Stable label used in configuration files and diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            SqlType::Bool => "bool",
            SqlType::Byte => "byte",
            SqlType::Int16 => "int16",
            SqlType::Int32 => "int32",
            SqlType::Int64 => "int64",
            SqlType::Float => "float",
            SqlType::Double => "double",
            SqlType::Decimal => "decimal",
            SqlType::String => "string",
            SqlType::DateTime => "datetime",
            SqlType::Guid => "guid",
            SqlType::Binary => "binary",
        }
    }

    /// Textual columns cannot be summed; the grouping rewrite blanks them.
    pub fn is_textual(self) -> bool {
        matches!(self, SqlType::String)
    }

    /// Decimal columns are the ones the grouping rewrite aggregates with `SUM`.
    pub fn is_decimal(self) -> bool {
        matches!(self, SqlType::Decimal)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SqlType::Byte
                | SqlType::Int16
                | SqlType::Int32
                | SqlType::Int64
                | SqlType::Float
                | SqlType::Double
                | SqlType::Decimal
        )
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SqlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SqlType::ALL
            .iter()
            .copied()
            .find(|t| t.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("Unknown SQL type label '{}'", s))
    }
}

/// The "unset" date-time sentinel: `0001-01-01T00:00:00`.
///
/// Any date-time at or before this instant is bound as SQL NULL.
pub fn unset_datetime() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

pub fn is_unset_datetime(value: &NaiveDateTime) -> bool {
    *value <= unset_datetime()
}

/// A single database cell or parameter value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Str(String),
    DateTime(NaiveDateTime),
    Guid(Uuid),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value naturally belongs to; `None` for NULL.
    pub fn sql_type(&self) -> Option<SqlType> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => SqlType::Bool,
            Value::Byte(_) => SqlType::Byte,
            Value::Int16(_) => SqlType::Int16,
            Value::Int32(_) => SqlType::Int32,
            Value::Int64(_) => SqlType::Int64,
            Value::Float(_) => SqlType::Float,
            Value::Double(_) => SqlType::Double,
            Value::Decimal(_) => SqlType::Decimal,
            Value::Str(_) => SqlType::String,
            Value::DateTime(_) => SqlType::DateTime,
            Value::Guid(_) => SqlType::Guid,
            Value::Bytes(_) => SqlType::Binary,
        })
    }

    /// Get type name for debugging/error messages.
    pub fn type_name(&self) -> &'static str {
        self.sql_type().map(SqlType::label).unwrap_or("null")
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Byte(b) => Some(i16::from(*b)),
            Value::Int16(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Byte(b) => Some(i32::from(*b)),
            Value::Int16(i) => Some(i32::from(*i)),
            Value::Int32(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract as i64, widening any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(b) => Some(i64::from(*b)),
            Value::Int16(i) => Some(i64::from(*i)),
            Value::Int32(i) => Some(i64::from(*i)),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Extract as f64 if the value is a float or an integer.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(f) => Some(*f),
            other => other.as_i64().map(|i| i as f64),
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            other => other.as_i64().map(Decimal::from),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Value::Guid(g) => Some(*g),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Numeric view used by running sums.
    ///
    /// Unlike [`Value::as_decimal`] this also accepts floats, booleans and
    /// numeric strings. NULL yields `Some(0)` so that empty cells do not
    /// interrupt an aggregate; any other non-numeric value yields `None`.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Null => Some(Decimal::ZERO),
            Value::Bool(b) => Some(Decimal::from(u8::from(*b))),
            Value::Float(f) => Decimal::try_from(f64::from(*f)).ok(),
            Value::Double(f) => Decimal::try_from(*f).ok(),
            Value::Str(s) => Decimal::from_str(s.trim()).ok(),
            other => other.as_decimal(),
        }
    }

    /// Extract as i64 with a default value.
    pub fn as_i64_or(&self, default: i64) -> i64 {
        self.as_i64().unwrap_or(default)
    }

    /// Extract as String with a default value.
    pub fn as_string_or(&self, default: &str) -> String {
        self.as_str().unwrap_or(default).to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "{}", b),
            Value::Int16(i) => write!(f, "{}", i),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Double(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Value::Guid(g) => write!(f, "{}", g),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    String => Str,
    NaiveDateTime => DateTime,
    Uuid => Guid,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
