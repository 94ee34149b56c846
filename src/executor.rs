//! Non-query and scalar command execution.
//!
//! Each call opens its own connection and closes it before returning. For a
//! stored procedure the status code is always retrievable: `@RETURN_VALUE` is
//! bound and inserted into the output map, which is created locally when the
//! caller passes none.

use tracing::debug;

use crate::db::{Command, CommandKind, Connection, DataSource, EngineError, Value};
use crate::error::{classify, classify_release, DalcError};
use crate::params::{build_command, refresh_outputs, OutputParams, ParamBuilder, Params, ID_PARAM};

/// Execute a command that returns no rows; returns the rows affected.
///
/// Every entry of `outputs` is refreshed from the engine's final values.
pub fn execute_non_query(
    source: &DataSource,
    text: &str,
    kind: CommandKind,
    params: Option<&Params>,
    outputs: Option<&mut OutputParams>,
) -> Result<u64, DalcError> {
    let mut local = OutputParams::new();
    let outputs = outputs.unwrap_or(&mut local);
    let command = build_command(source, text, kind, params, Some(&mut *outputs))?;
    let mut connection = source.open_connection(&command)?;

    let executed = connection.execute_non_query(&command);
    let closed = connection.close();
    let execution = executed.map_err(|e| source.fail(classify(&e, Some(&command))))?;

    refresh_outputs(outputs, &execution.outputs);
    finish(source, &command, closed)?;
    debug!(rows_affected = execution.rows_affected, sql = %command.text, "executed non-query");
    Ok(execution.rows_affected)
}

/// [`execute_non_query`] with a single `@id` parameter.
pub fn execute_non_query_by_id(
    source: &DataSource,
    text: &str,
    id: i32,
    kind: CommandKind,
    outputs: Option<&mut OutputParams>,
) -> Result<u64, DalcError> {
    let params = ParamBuilder::new().with(ID_PARAM, id).build();
    execute_non_query(source, text, kind, Some(&params), outputs)
}

/// Execute a command and return the first column of its first row.
///
/// Further columns, rows and result sets are ignored. `None` when the command
/// produced no row.
pub fn execute_scalar(
    source: &DataSource,
    text: &str,
    kind: CommandKind,
    params: Option<&Params>,
    outputs: Option<&mut OutputParams>,
) -> Result<Option<Value>, DalcError> {
    let mut local = OutputParams::new();
    let outputs = outputs.unwrap_or(&mut local);
    let command = build_command(source, text, kind, params, Some(&mut *outputs))?;
    let mut connection = source.open_connection(&command)?;

    let scanned = first_value(connection.as_mut(), &command);
    let closed = connection.close();
    let (value, finals) = scanned.map_err(|e| source.fail(classify(&e, Some(&command))))?;

    refresh_outputs(outputs, &finals);
    finish(source, &command, closed)?;
    debug!(found = value.is_some(), sql = %command.text, "executed scalar");
    Ok(value)
}

/// [`execute_scalar`] with a single `@id` parameter.
pub fn execute_scalar_by_id(
    source: &DataSource,
    text: &str,
    id: i32,
    kind: CommandKind,
    outputs: Option<&mut OutputParams>,
) -> Result<Option<Value>, DalcError> {
    let params = ParamBuilder::new().with(ID_PARAM, id).build();
    execute_scalar(source, text, kind, Some(&params), outputs)
}

/// Read the first value, then close the cursor so the outputs are final.
fn first_value(
    connection: &mut dyn Connection,
    command: &Command,
) -> Result<(Option<Value>, Vec<(String, Value)>), EngineError> {
    let mut cursor = connection.execute_reader(command)?;
    let value = if cursor.read()? && cursor.field_count() > 0 {
        Some(cursor.value(0)?.clone())
    } else {
        None
    };
    cursor.close()?;
    let finals = cursor.outputs().map(<[_]>::to_vec).unwrap_or_default();
    Ok((value, finals))
}

fn finish(
    source: &DataSource,
    command: &Command,
    closed: Result<(), EngineError>,
) -> Result<(), DalcError> {
    closed.map_err(|e| source.fail(classify_release(&[e], Some(command))))
}
