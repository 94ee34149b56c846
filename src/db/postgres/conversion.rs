//! Type conversion between `Value` and PostgreSQL types.
//!
//! Handles:
//! - `Value` → `ToSql`, driven by the parameter type the server inferred
//! - row cells → `Value`, driven by the column type
//! - `postgres::Error` → `EngineError`

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{FromSql, ToSql, Type};
use postgres::Row;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::backend::{EngineError, SubError};
use crate::db::value::{SqlType, Value};

/// SQLSTATE `query_canceled`, raised when `statement_timeout` expires.
const QUERY_CANCELED: &str = "57014";

pub(super) type SqlParam = Box<dyn ToSql + Sync>;

/// Map a PostgreSQL type onto the closed type set.
pub(super) fn sql_type_of(ty: &Type) -> Option<SqlType> {
    let mapped = if *ty == Type::BOOL {
        SqlType::Bool
    } else if *ty == Type::CHAR {
        SqlType::Byte
    } else if *ty == Type::INT2 {
        SqlType::Int16
    } else if *ty == Type::INT4 {
        SqlType::Int32
    } else if *ty == Type::INT8 {
        SqlType::Int64
    } else if *ty == Type::FLOAT4 {
        SqlType::Float
    } else if *ty == Type::FLOAT8 {
        SqlType::Double
    } else if *ty == Type::NUMERIC {
        SqlType::Decimal
    } else if is_text(ty) {
        SqlType::String
    } else if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ || *ty == Type::DATE {
        SqlType::DateTime
    } else if *ty == Type::UUID {
        SqlType::Guid
    } else if *ty == Type::BYTEA {
        SqlType::Binary
    } else {
        return None;
    };
    Some(mapped)
}

fn is_text(ty: &Type) -> bool {
    *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
}

pub(super) fn unsupported_type(ty: &Type) -> EngineError {
    EngineError::Unsupported {
        what: "PostgreSQL type",
        name: ty.name().to_string(),
    }
}

fn bind<T>(
    value: &Value,
    name: &str,
    expected: SqlType,
    extract: impl FnOnce(&Value) -> Option<T>,
) -> Result<SqlParam, EngineError>
where
    T: ToSql + Sync + 'static,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    match extract(value) {
        Some(v) => Ok(Box::new(Some(v))),
        None => Err(EngineError::InvalidCast {
            target: name.to_string(),
            expected: expected.label(),
            found: value.type_name(),
        }),
    }
}

/// Convert a bound value for a parameter of type `ty`.
///
/// NULL is sent as a typed `None` so the server sees the right type.
pub(super) fn to_sql(value: &Value, name: &str, ty: &Type) -> Result<SqlParam, EngineError> {
    let expected = sql_type_of(ty).ok_or_else(|| unsupported_type(ty))?;
    if *ty == Type::CHAR {
        return bind(value, name, expected, |v| v.as_u8().map(|b| b as i8));
    }
    if *ty == Type::TIMESTAMPTZ {
        return bind(value, name, expected, |v| v.as_datetime().map(|dt| dt.and_utc()));
    }
    if *ty == Type::DATE {
        return bind(value, name, expected, |v| v.as_datetime().map(|dt| dt.date()));
    }
    match expected {
        SqlType::Bool => bind(value, name, expected, Value::as_bool),
        SqlType::Byte => bind(value, name, expected, |v| v.as_u8().map(|b| b as i8)),
        SqlType::Int16 => bind(value, name, expected, Value::as_i16),
        SqlType::Int32 => bind(value, name, expected, Value::as_i32),
        SqlType::Int64 => bind(value, name, expected, Value::as_i64),
        SqlType::Float => bind(value, name, expected, |v| v.as_f64().map(|f| f as f32)),
        SqlType::Double => bind(value, name, expected, Value::as_f64),
        SqlType::Decimal => bind(value, name, expected, Value::as_decimal),
        SqlType::String => bind(value, name, expected, |v| match v {
            Value::Str(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
        SqlType::DateTime => bind(value, name, expected, Value::as_datetime),
        SqlType::Guid => bind(value, name, expected, Value::as_guid),
        SqlType::Binary => bind(value, name, expected, |v| v.as_bytes().map(<[u8]>::to_vec)),
    }
}

fn get<'a, T>(row: &'a Row, idx: usize, wrap: impl FnOnce(T) -> Value) -> Result<Value, EngineError>
where
    T: FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map(wrap).unwrap_or(Value::Null))
        .map_err(|e| from_pg_error(e, None))
}

/// Read one cell.
pub(super) fn read_value(row: &Row, idx: usize) -> Result<Value, EngineError> {
    let ty = row.columns()[idx].type_();
    if *ty == Type::CHAR {
        return get::<i8>(row, idx, |b| Value::Byte(b as u8));
    }
    if *ty == Type::TIMESTAMPTZ {
        return get::<DateTime<Utc>>(row, idx, |dt| Value::DateTime(dt.naive_utc()));
    }
    if *ty == Type::DATE {
        return get::<NaiveDate>(row, idx, |d| Value::DateTime(d.and_time(NaiveTime::MIN)));
    }
    match sql_type_of(ty).ok_or_else(|| unsupported_type(ty))? {
        SqlType::Bool => get::<bool>(row, idx, Value::Bool),
        SqlType::Byte => get::<i8>(row, idx, |b| Value::Byte(b as u8)),
        SqlType::Int16 => get::<i16>(row, idx, Value::Int16),
        SqlType::Int32 => get::<i32>(row, idx, Value::Int32),
        SqlType::Int64 => get::<i64>(row, idx, Value::Int64),
        SqlType::Float => get::<f32>(row, idx, Value::Float),
        SqlType::Double => get::<f64>(row, idx, Value::Double),
        SqlType::Decimal => get::<Decimal>(row, idx, Value::Decimal),
        SqlType::String => get::<String>(row, idx, Value::Str),
        SqlType::DateTime => get::<NaiveDateTime>(row, idx, Value::DateTime),
        SqlType::Guid => get::<Uuid>(row, idx, Value::Guid),
        SqlType::Binary => get::<Vec<u8>>(row, idx, Value::Bytes),
    }
}

pub(super) fn read_row(row: &Row) -> Result<Vec<Value>, EngineError> {
    (0..row.len()).map(|idx| read_value(row, idx)).collect()
}

/// Classify a driver error.
///
/// Server errors keep their SQLSTATE so privilege failures (`42501`) can be
/// recognized; a cancelled statement becomes a timeout.
pub(super) fn from_pg_error(error: postgres::Error, timeout: Option<Duration>) -> EngineError {
    match error.as_db_error() {
        Some(db) if db.code().code() == QUERY_CANCELED => {
            EngineError::Timeout(timeout.unwrap_or_default())
        }
        Some(db) => EngineError::Server {
            message: db.message().to_string(),
            errors: vec![SubError::new(0, db.message()).with_state(db.code().code())],
        },
        None => EngineError::Connection {
            message: error.to_string(),
        },
    }
}
