//! Parameter values, coercion and binding.
//!
//! Callers hand parameters over a loosely-typed boundary: either a plain
//! [`Value`] or a string tagged with the type it should become. Coercion
//! follows two NULL conventions:
//! - an empty string tagged with a non-textual type is bound as NULL;
//! - a date-time at or before `0001-01-01T00:00:00` is bound as NULL.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    is_unset_datetime, Command, CommandKind, DataSource, ParameterBinding, SqlType, Value,
};
use crate::error::{DalcError, Diagnostic};

/// Reserved name of the stored-procedure status code.
pub const RETURN_VALUE_PARAM: &str = "@RETURN_VALUE";

/// Name of the single parameter bound by the `*_by_id` helpers.
pub const ID_PARAM: &str = "@id";

/// Placeholder held by the return value until the command has completed.
pub const RETURN_VALUE_PLACEHOLDER: i32 = -1;

static PARAM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@[A-Za-z_][A-Za-z0-9_]*$").expect("parameter name pattern is valid")
});

/// A parameter as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Plain(Value),
    /// A string to be parsed into `declared` before binding.
    Tagged { text: String, declared: SqlType },
}

impl ParamValue {
    pub fn tagged(text: impl Into<String>, declared: SqlType) -> Self {
        Self::Tagged {
            text: text.into(),
            declared,
        }
    }

    pub fn null() -> Self {
        Self::Plain(Value::Null)
    }
}

impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        Self::Plain(v)
    }
}

macro_rules! param_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    Self::Plain(Value::from(v))
                }
            }
        )*
    };
}

param_from!(bool, i16, i32, i64, f64, Decimal, String, &str, NaiveDateTime, Uuid);

/// Input parameters keyed by name (`@name`).
pub type Params = BTreeMap<String, ParamValue>;

/// Output and return parameters keyed by name. Values are placeholders until
/// the command completes, then refreshed in place.
pub type OutputParams = BTreeMap<String, Value>;

/// Helper for building parameter maps.
#[derive(Debug, Clone, Default)]
pub struct ParamBuilder {
    params: Params,
}

impl ParamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_tagged(mut self, name: impl Into<String>, text: &str, declared: SqlType) -> Self {
        self.params
            .insert(name.into(), ParamValue::tagged(text, declared));
        self
    }

    pub fn build(self) -> Params {
        self.params
    }
}

/// The stored-procedure status code, once the command has completed.
pub fn return_code(outputs: &OutputParams) -> Option<i64> {
    outputs.get(RETURN_VALUE_PARAM).and_then(Value::as_i64)
}

pub fn validate_name(name: &str) -> Result<(), String> {
    if PARAM_NAME.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "Parameter name '{}' must start with '@' followed by an identifier",
            name
        ))
    }
}

/// Coerce a caller-supplied value into the value actually bound.
pub fn coerce(value: &ParamValue) -> Result<Value, String> {
    match value {
        ParamValue::Plain(Value::DateTime(dt)) if is_unset_datetime(dt) => Ok(Value::Null),
        ParamValue::Plain(v) => Ok(v.clone()),
        ParamValue::Tagged { text, declared } => parse_tagged(text, *declared),
    }
}

fn parse_tagged(text: &str, declared: SqlType) -> Result<Value, String> {
    if text.is_empty() {
        return Ok(if declared.is_textual() {
            Value::Str(String::new())
        } else {
            Value::Null
        });
    }

    let trimmed = text.trim();
    let invalid = |e: &dyn std::fmt::Display| {
        format!("Cannot convert '{}' to {}: {}", text, declared, e)
    };
    let value = match declared {
        SqlType::String => Value::Str(text.to_string()),
        SqlType::Bool => Value::Bool(parse_bool(trimmed).ok_or_else(|| invalid(&"expected true/false"))?),
        SqlType::Byte => Value::Byte(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Int16 => Value::Int16(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Int32 => Value::Int32(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Int64 => Value::Int64(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Float => Value::Float(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Double => Value::Double(trimmed.parse().map_err(|e| invalid(&e))?),
        SqlType::Decimal => Value::Decimal(
            Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map_err(|e| invalid(&e))?,
        ),
        SqlType::DateTime => {
            let dt = parse_datetime(trimmed).ok_or_else(|| invalid(&"unrecognized date-time format"))?;
            if is_unset_datetime(&dt) {
                Value::Null
            } else {
                Value::DateTime(dt)
            }
        }
        SqlType::Guid => Value::Guid(Uuid::parse_str(trimmed).map_err(|e| invalid(&e))?),
        SqlType::Binary => {
            return Err(invalid(&"binary values cannot be bound from text"));
        }
    };
    Ok(value)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Coerce and validate input parameters.
pub fn bind_inputs(params: Option<&Params>) -> Result<Vec<ParameterBinding>, Diagnostic> {
    let Some(params) = params else {
        return Ok(Vec::new());
    };
    params
        .iter()
        .map(|(name, value)| {
            validate_name(name).map_err(Diagnostic::configuration)?;
            let bound = coerce(value).map_err(|e| {
                Diagnostic::configuration(format!("Parameter '{}': {}", name, e))
            })?;
            let mut binding = ParameterBinding::input(name.clone(), bound);
            if let ParamValue::Tagged { declared, .. } = value {
                binding.declared = Some(*declared);
            }
            Ok(binding)
        })
        .collect()
}

/// Bind output parameters, adding the return value for stored procedures.
///
/// Each entry of `outputs` becomes an unconstrained-size output binding. For a
/// stored procedure `@RETURN_VALUE` is inserted into `outputs` with a `-1`
/// placeholder and bound with return direction.
pub fn bind_outputs(
    source: &DataSource,
    kind: CommandKind,
    outputs: &mut OutputParams,
    bindings: &mut Vec<ParameterBinding>,
) -> Result<(), Diagnostic> {
    let wants_return = kind == CommandKind::StoredProcedure;
    if (wants_return || !outputs.is_empty()) && !source.engine().supports_unbounded_output() {
        return Err(Diagnostic::configuration(format!(
            "The {} engine cannot bind unconstrained-size output parameters",
            source.engine().backend_name()
        )));
    }

    for (name, value) in outputs.iter() {
        if name.eq_ignore_ascii_case(RETURN_VALUE_PARAM) {
            continue;
        }
        validate_name(name).map_err(Diagnostic::configuration)?;
        bindings.push(ParameterBinding::output(name.clone(), value.clone()));
    }

    if wants_return {
        outputs.insert(
            RETURN_VALUE_PARAM.to_string(),
            Value::Int32(RETURN_VALUE_PLACEHOLDER),
        );
        bindings.push(ParameterBinding::return_value(RETURN_VALUE_PARAM));
    }
    Ok(())
}

/// Build a command for the executor and the cursor.
pub(crate) fn build_command(
    source: &DataSource,
    text: &str,
    kind: CommandKind,
    params: Option<&Params>,
    outputs: Option<&mut OutputParams>,
) -> Result<Command, DalcError> {
    let mut command = Command::new(text, kind);
    command.timeout = source.command_timeout();

    let bound = bind_inputs(params).and_then(|mut bindings| {
        if let Some(outputs) = outputs {
            bind_outputs(source, kind, outputs, &mut bindings)?;
        }
        Ok(bindings)
    });
    match bound {
        Ok(bindings) => {
            command.parameters = bindings;
            Ok(command)
        }
        Err(diagnostic) => Err(source.fail(diagnostic.with_sql(text))),
    }
}

/// Refresh every entry of `outputs` from the engine's final values.
///
/// Entries the engine did not report keep their current value.
pub fn refresh_outputs(outputs: &mut OutputParams, finals: &[(String, Value)]) {
    for (name, value) in outputs.iter_mut() {
        if let Some((_, fresh)) = finals.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            *value = fresh.clone();
        }
    }
}
