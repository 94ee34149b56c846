//! Managed forward-only cursor.
//!
//! A [`ManagedCursor`] owns exactly one connection, one command and one engine
//! cursor. It is opened (and the command executed) on construction, read with
//! ordinal-indexed accessors, and released by [`ManagedCursor::close`] or
//! [`ManagedCursor::dispose`]. Release order is cursor, connection, command;
//! output and return parameters are captured at that point, because the engine
//! only finalizes them once the result stream is finished.
//!
//! Prefer [`with_cursor`], which closes the cursor on every exit path. A cursor
//! dropped without being closed is still released, and a developer-misuse
//! diagnostic is reported.
//!
//! # Examples
//!
//! ```ignore
//! let names = with_cursor(&source, "SELECT name FROM t", CommandKind::Text, None, |cursor| {
//!     let mut names = Vec::new();
//!     while cursor.read()? {
//!         names.push(cursor.get_string(0)?);
//!     }
//!     Ok(names)
//! })?;
//! ```

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::db::{
    ColumnSchema, Command, CommandKind, Connection, ConnectionState, Cursor, DataSource,
    EngineError, SqlType, Value,
};
use crate::error::{classify, classify_release, DalcError, Diagnostic};
use crate::params::{build_command, refresh_outputs, OutputParams, ParamValue, Params, ID_PARAM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Created,
    Executing,
    Open,
    Closed,
    Disposed,
}

impl CursorState {
    fn is_released(self) -> bool {
        matches!(self, CursorState::Closed | CursorState::Disposed)
    }
}

pub struct ManagedCursor {
    source: DataSource,
    command: Command,
    connection: Option<Box<dyn Connection>>,
    cursor: Option<Box<dyn Cursor>>,
    outputs: OutputParams,
    state: CursorState,
}

impl ManagedCursor {
    /// Execute `text` and position before the first row.
    pub fn open(
        source: &DataSource,
        text: &str,
        kind: CommandKind,
        params: Option<&Params>,
    ) -> Result<Self, DalcError> {
        Self::execute(source, text, kind, params, None)
    }

    /// Like [`ManagedCursor::open`], binding `outputs` as output parameters.
    ///
    /// For a stored procedure `@RETURN_VALUE` is added as well. The values stay
    /// placeholders until the stream is drained or the cursor is closed; read
    /// them with [`ManagedCursor::output_parameters`].
    pub fn open_with_output(
        source: &DataSource,
        text: &str,
        kind: CommandKind,
        params: Option<&Params>,
        outputs: OutputParams,
    ) -> Result<Self, DalcError> {
        Self::execute(source, text, kind, params, Some(outputs))
    }

    /// Open with a single `@id` parameter.
    pub fn open_by_id(
        source: &DataSource,
        text: &str,
        id: i32,
        kind: CommandKind,
    ) -> Result<Self, DalcError> {
        let mut params = Params::new();
        params.insert(ID_PARAM.to_string(), ParamValue::from(id));
        Self::open(source, text, kind, Some(&params))
    }

    /// Open with a short list of `(name, value)` pairs.
    pub fn open_with_pairs<N, V>(
        source: &DataSource,
        text: &str,
        kind: CommandKind,
        pairs: impl IntoIterator<Item = (N, V)>,
    ) -> Result<Self, DalcError>
    where
        N: Into<String>,
        V: Into<ParamValue>,
    {
        let params: Params = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self::open(source, text, kind, Some(&params))
    }

    fn execute(
        source: &DataSource,
        text: &str,
        kind: CommandKind,
        params: Option<&Params>,
        outputs: Option<OutputParams>,
    ) -> Result<Self, DalcError> {
        let bind_outputs = outputs.is_some();
        let mut map = outputs.unwrap_or_default();
        let command = build_command(
            source,
            text,
            kind,
            params,
            bind_outputs.then_some(&mut map),
        )?;
        let mut managed = Self {
            source: source.clone(),
            command,
            connection: None,
            cursor: None,
            outputs: map,
            state: CursorState::Created,
        };

        managed.state = CursorState::Executing;
        match managed.start() {
            Ok(()) => {
                managed.state = CursorState::Open;
                debug!(sql = %managed.command.text, "cursor opened");
                Ok(managed)
            }
            Err(diagnostic) => {
                let _ = managed.release();
                managed.state = CursorState::Disposed;
                Err(managed.source.fail(diagnostic))
            }
        }
    }

    fn start(&mut self) -> Result<(), Diagnostic> {
        let mut connection = self
            .source
            .engine()
            .connect(self.source.connection_string())
            .map_err(|e| classify(&e, Some(&self.command)))?;
        let opened = connection.open();
        self.connection = Some(connection);
        opened.map_err(|e| classify(&e, Some(&self.command)))?;

        let cursor = match self.connection.as_mut() {
            Some(connection) => connection.execute_reader(&self.command),
            None => Err(EngineError::NotOpen),
        }
        .map_err(|e| classify(&e, Some(&self.command)))?;
        self.cursor = Some(cursor);
        Ok(())
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The executed command, including its bound parameters.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Output and return parameters. Placeholders until the stream has been
    /// drained or the cursor closed.
    pub fn output_parameters(&self) -> &OutputParams {
        &self.outputs
    }

    pub fn return_code(&self) -> Option<i64> {
        crate::params::return_code(&self.outputs)
    }

    fn cursor(&self) -> Result<&dyn Cursor, DalcError> {
        self.cursor
            .as_deref()
            .ok_or_else(|| accessor_error(EngineError::CursorClosed))
    }

    fn cursor_mut(&mut self) -> Result<&mut Box<dyn Cursor>, DalcError> {
        self.cursor
            .as_mut()
            .ok_or_else(|| accessor_error(EngineError::CursorClosed))
    }

    /// Pick up output values once the engine has published them.
    fn capture_outputs(&mut self) {
        if let Some(finals) = self.cursor.as_ref().and_then(|c| c.outputs()) {
            refresh_outputs(&mut self.outputs, finals);
        }
    }

    /// Advance to the next row.
    pub fn read(&mut self) -> Result<bool, DalcError> {
        let advanced = self.cursor_mut()?.read();
        self.after_advance(advanced)
    }

    /// Advance to the next result set.
    pub fn next_result(&mut self) -> Result<bool, DalcError> {
        let advanced = self.cursor_mut()?.next_result();
        self.after_advance(advanced)
    }

    fn after_advance(&mut self, advanced: Result<bool, EngineError>) -> Result<bool, DalcError> {
        match advanced {
            Ok(more) => {
                if !more {
                    self.capture_outputs();
                }
                Ok(more)
            }
            Err(e) => Err(self.source.fail(classify(&e, Some(&self.command)))),
        }
    }

    pub fn get_value(&self, ordinal: usize) -> Result<Value, DalcError> {
        self.value(ordinal).cloned()
    }

    /// Raw value in the current row.
    pub fn value(&self, ordinal: usize) -> Result<&Value, DalcError> {
        self.cursor()?.value(ordinal).map_err(accessor_error)
    }

    /// Copy the current row into `values`; returns the number copied.
    pub fn get_values(&self, values: &mut [Value]) -> Result<usize, DalcError> {
        let count = values.len().min(self.field_count()?);
        for (ordinal, slot) in values.iter_mut().take(count).enumerate() {
            *slot = self.get_value(ordinal)?;
        }
        Ok(count)
    }

    pub fn is_null(&self, ordinal: usize) -> Result<bool, DalcError> {
        Ok(self.value(ordinal)?.is_null())
    }

    pub fn get_bool(&self, ordinal: usize) -> Result<bool, DalcError> {
        self.typed(ordinal, SqlType::Bool, Value::as_bool)
    }

    pub fn get_byte(&self, ordinal: usize) -> Result<u8, DalcError> {
        self.typed(ordinal, SqlType::Byte, Value::as_u8)
    }

    pub fn get_i16(&self, ordinal: usize) -> Result<i16, DalcError> {
        self.typed(ordinal, SqlType::Int16, Value::as_i16)
    }

    pub fn get_i32(&self, ordinal: usize) -> Result<i32, DalcError> {
        self.typed(ordinal, SqlType::Int32, Value::as_i32)
    }

    pub fn get_i64(&self, ordinal: usize) -> Result<i64, DalcError> {
        self.typed(ordinal, SqlType::Int64, Value::as_i64)
    }

    pub fn get_f32(&self, ordinal: usize) -> Result<f32, DalcError> {
        self.typed(ordinal, SqlType::Float, Value::as_f32)
    }

    pub fn get_f64(&self, ordinal: usize) -> Result<f64, DalcError> {
        self.typed(ordinal, SqlType::Double, Value::as_f64)
    }

    pub fn get_decimal(&self, ordinal: usize) -> Result<Decimal, DalcError> {
        self.typed(ordinal, SqlType::Decimal, Value::as_decimal)
    }

    pub fn get_string(&self, ordinal: usize) -> Result<String, DalcError> {
        self.typed(ordinal, SqlType::String, |v| v.as_str().map(str::to_string))
    }

    pub fn get_datetime(&self, ordinal: usize) -> Result<NaiveDateTime, DalcError> {
        self.typed(ordinal, SqlType::DateTime, Value::as_datetime)
    }

    pub fn get_guid(&self, ordinal: usize) -> Result<Uuid, DalcError> {
        self.typed(ordinal, SqlType::Guid, Value::as_guid)
    }

    /// Single character of a text column.
    pub fn get_char(&self, ordinal: usize) -> Result<char, DalcError> {
        self.typed(ordinal, SqlType::String, |v| v.as_str().and_then(|s| s.chars().next()))
    }

    fn typed<T>(
        &self,
        ordinal: usize,
        expected: SqlType,
        extract: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<T, DalcError> {
        let value = self.value(ordinal)?;
        extract(value).ok_or_else(|| self.cast_error(ordinal, expected, value))
    }

    fn cast_error(&self, ordinal: usize, expected: SqlType, value: &Value) -> DalcError {
        let target = self
            .get_name(ordinal)
            .unwrap_or_else(|_| format!("#{}", ordinal));
        accessor_error(EngineError::InvalidCast {
            target,
            expected: expected.label(),
            found: value.type_name(),
        })
    }

    /// Value converted to the declared type. NULL stays NULL.
    pub fn get_typed(&self, ordinal: usize, declared: SqlType) -> Result<Value, DalcError> {
        let value = self.value(ordinal)?;
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match declared {
            SqlType::Bool => value.as_bool().map(Value::Bool),
            SqlType::Byte => value.as_u8().map(Value::Byte),
            SqlType::Int16 => value.as_i16().map(Value::Int16),
            SqlType::Int32 => value.as_i32().map(Value::Int32),
            SqlType::Int64 => value.as_i64().map(Value::Int64),
            SqlType::Float => value.as_f32().map(Value::Float),
            SqlType::Double => value.as_f64().map(Value::Double),
            SqlType::Decimal => value.as_decimal().map(Value::Decimal),
            SqlType::String => value.as_str().map(|s| Value::Str(s.to_string())),
            SqlType::DateTime => value.as_datetime().map(Value::DateTime),
            SqlType::Guid => value.as_guid().map(Value::Guid),
            SqlType::Binary => value.as_bytes().map(|b| Value::Bytes(b.to_vec())),
        };
        converted.ok_or_else(|| self.cast_error(ordinal, declared, value))
    }

    /// Chunked read of a binary column.
    ///
    /// Copies bytes starting at `field_offset` into `buffer[buffer_offset..]`,
    /// at most `length` of them, and returns the number copied. With no buffer,
    /// returns the total length of the field.
    pub fn get_bytes(
        &self,
        ordinal: usize,
        field_offset: usize,
        buffer: Option<&mut [u8]>,
        buffer_offset: usize,
        length: usize,
    ) -> Result<usize, DalcError> {
        let bytes = self.typed(ordinal, SqlType::Binary, |v| v.as_bytes().map(<[u8]>::to_vec))?;
        Ok(copy_chunk(&bytes, field_offset, buffer, buffer_offset, length))
    }

    /// Chunked read of a text column, counted in characters.
    pub fn get_chars(
        &self,
        ordinal: usize,
        field_offset: usize,
        buffer: Option<&mut [char]>,
        buffer_offset: usize,
        length: usize,
    ) -> Result<usize, DalcError> {
        let chars: Vec<char> =
            self.typed(ordinal, SqlType::String, |v| v.as_str().map(|s| s.chars().collect()))?;
        Ok(copy_chunk(&chars, field_offset, buffer, buffer_offset, length))
    }

    pub fn schema(&self) -> Result<&[ColumnSchema], DalcError> {
        Ok(self.cursor()?.schema())
    }

    fn column(&self, ordinal: usize) -> Result<&ColumnSchema, DalcError> {
        let schema = self.schema()?;
        schema.get(ordinal).ok_or_else(|| {
            accessor_error(EngineError::OrdinalOutOfRange {
                ordinal,
                count: schema.len(),
            })
        })
    }

    pub fn get_name(&self, ordinal: usize) -> Result<String, DalcError> {
        Ok(self.column(ordinal)?.name.clone())
    }

    pub fn get_ordinal(&self, name: &str) -> Result<usize, DalcError> {
        self.cursor()?.ordinal(name).ok_or_else(|| {
            accessor_error(EngineError::Unsupported {
                what: "column",
                name: name.to_string(),
            })
        })
    }

    /// Engine-native type name of a column.
    pub fn get_data_type_name(&self, ordinal: usize) -> Result<String, DalcError> {
        Ok(self.column(ordinal)?.type_name.clone())
    }

    pub fn get_field_type(&self, ordinal: usize) -> Result<SqlType, DalcError> {
        Ok(self.column(ordinal)?.data_type)
    }

    pub fn field_count(&self) -> Result<usize, DalcError> {
        Ok(self.cursor()?.field_count())
    }

    pub fn records_affected(&self) -> Result<i64, DalcError> {
        Ok(self.cursor()?.records_affected())
    }

    pub fn depth(&self) -> Result<usize, DalcError> {
        Ok(self.cursor()?.depth())
    }

    pub fn has_rows(&self) -> Result<bool, DalcError> {
        Ok(self.cursor()?.has_rows())
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_released() || self.cursor.as_ref().is_none_or(|c| c.is_closed())
    }

    /// Release the cursor, then the connection, then the command.
    ///
    /// Output parameters hold their final values afterwards. Closing a closed
    /// cursor does nothing.
    pub fn close(&mut self) -> Result<(), DalcError> {
        if self.state.is_released() {
            return Ok(());
        }
        let errors = self.release();
        self.state = CursorState::Closed;
        self.check_release(errors)
    }

    /// Release everything and mark the cursor unusable. Idempotent.
    pub fn dispose(&mut self) -> Result<(), DalcError> {
        if self.state == CursorState::Disposed {
            return Ok(());
        }
        let errors = self.release();
        self.state = CursorState::Disposed;
        self.check_release(errors)
    }

    fn check_release(&self, errors: Vec<EngineError>) -> Result<(), DalcError> {
        if errors.is_empty() {
            debug!(sql = %self.command.text, "cursor closed");
            Ok(())
        } else {
            Err(self.source.fail(classify_release(&errors, Some(&self.command))))
        }
    }

    /// Tolerates parts that are already released.
    fn release(&mut self) -> Vec<EngineError> {
        let mut errors = Vec::new();
        if let Some(mut cursor) = self.cursor.take() {
            if !cursor.is_closed()
                && let Err(e) = cursor.close()
            {
                errors.push(e);
            }
            if let Some(finals) = cursor.outputs() {
                refresh_outputs(&mut self.outputs, finals);
            }
        }
        if let Some(mut connection) = self.connection.take()
            && connection.state() != ConnectionState::Closed
            && let Err(e) = connection.close()
        {
            errors.push(e);
        }
        errors
    }
}

impl Drop for ManagedCursor {
    fn drop(&mut self) {
        if self.state.is_released() {
            return;
        }
        let errors = self.release();
        self.state = CursorState::Disposed;
        let mut diagnostic = Diagnostic::developer_misuse(
            "ManagedCursor dropped without close(); resources were released by Drop",
        )
        .with_command(&self.command);
        if !errors.is_empty() {
            let causes: Vec<String> = errors.iter().map(ToString::to_string).collect();
            diagnostic = diagnostic.with_cause(causes.join("; "));
        }
        self.source.reporter().report(&diagnostic);
    }
}

impl std::fmt::Debug for ManagedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCursor")
            .field("state", &self.state)
            .field("sql", &self.command.text)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

fn accessor_error(error: EngineError) -> DalcError {
    DalcError::from(classify(&error, None))
}

fn copy_chunk<T: Copy>(
    source: &[T],
    field_offset: usize,
    buffer: Option<&mut [T]>,
    buffer_offset: usize,
    length: usize,
) -> usize {
    let Some(buffer) = buffer else {
        return source.len();
    };
    let available = source.len().saturating_sub(field_offset);
    let room = buffer.len().saturating_sub(buffer_offset);
    let count = length.min(available).min(room);
    if count > 0 {
        buffer[buffer_offset..buffer_offset + count]
            .copy_from_slice(&source[field_offset..field_offset + count]);
    }
    count
}

/// Open a cursor, hand it to `f`, and close it on every exit path.
///
/// An error from `f` wins over a failure to close.
pub fn with_cursor<T>(
    source: &DataSource,
    text: &str,
    kind: CommandKind,
    params: Option<&Params>,
    f: impl FnOnce(&mut ManagedCursor) -> Result<T, DalcError>,
) -> Result<T, DalcError> {
    let mut cursor = ManagedCursor::open(source, text, kind, params)?;
    finish(&mut cursor, f)
}

/// [`with_cursor`] with output parameters; `outputs` is refreshed after close.
pub fn with_cursor_outputs<T>(
    source: &DataSource,
    text: &str,
    kind: CommandKind,
    params: Option<&Params>,
    outputs: &mut OutputParams,
    f: impl FnOnce(&mut ManagedCursor) -> Result<T, DalcError>,
) -> Result<T, DalcError> {
    let mut cursor = ManagedCursor::open_with_output(source, text, kind, params, outputs.clone())?;
    let result = finish(&mut cursor, f);
    *outputs = cursor.output_parameters().clone();
    result
}

fn finish<T>(
    cursor: &mut ManagedCursor,
    f: impl FnOnce(&mut ManagedCursor) -> Result<T, DalcError>,
) -> Result<T, DalcError> {
    let result = f(cursor);
    let closed = cursor.close();
    let value = result?;
    closed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemEngine, MemResponse, ResultSet};
    use crate::error::DiagnosticKind;
    use crate::params::RETURN_VALUE_PARAM;
    use crate::report::MemoryReporter;
    use rstest::{fixture, rstest};
    use std::sync::Arc;

    struct Harness {
        engine: MemEngine,
        reporter: MemoryReporter,
        source: DataSource,
    }

    #[fixture]
    fn harness() -> Harness {
        let engine = MemEngine::new();
        let reporter = MemoryReporter::new();
        let source =
            DataSource::memory(engine.clone()).with_reporter(Arc::new(reporter.clone()));
        engine.respond_default(MemResponse::rows(people()));
        Harness {
            engine,
            reporter,
            source,
        }
    }

    fn people() -> ResultSet {
        let id = Uuid::nil();
        ResultSet::with_columns(&[
            ("id", SqlType::Int32),
            ("name", SqlType::String),
            ("balance", SqlType::Decimal),
            ("active", SqlType::Bool),
            ("avatar", SqlType::Binary),
            ("key", SqlType::Guid),
        ])
        .row(vec![
            Value::Int32(1),
            Value::from("Ann"),
            Value::Decimal(Decimal::new(1050, 2)),
            Value::Bool(true),
            Value::Bytes(vec![1, 2, 3, 4, 5]),
            Value::Guid(id),
        ])
        .row(vec![
            Value::Int32(2),
            Value::Null,
            Value::Null,
            Value::Bool(false),
            Value::Null,
            Value::Null,
        ])
    }

    #[rstest]
    fn test_typed_accessors(harness: Harness) {
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        assert_eq!(cursor.state(), CursorState::Open);
        assert!(cursor.has_rows().unwrap());
        assert_eq!(cursor.field_count().unwrap(), 6);
        assert!(cursor.read().unwrap());
        assert_eq!(cursor.get_i32(0).unwrap(), 1);
        assert_eq!(cursor.get_i64(0).unwrap(), 1);
        assert_eq!(cursor.get_string(1).unwrap(), "Ann");
        assert_eq!(cursor.get_char(1).unwrap(), 'A');
        assert_eq!(cursor.get_decimal(2).unwrap(), Decimal::new(1050, 2));
        assert!(cursor.get_bool(3).unwrap());
        assert_eq!(cursor.get_guid(5).unwrap(), Uuid::nil());
        assert_eq!(cursor.get_ordinal("NAME").unwrap(), 1);
        assert_eq!(cursor.get_name(2).unwrap(), "balance");
        assert_eq!(cursor.get_field_type(2).unwrap(), SqlType::Decimal);
        assert_eq!(cursor.get_data_type_name(2).unwrap(), "decimal");

        assert!(cursor.read().unwrap());
        assert!(cursor.is_null(1).unwrap());
        assert_eq!(cursor.get_typed(1, SqlType::String).unwrap(), Value::Null);
        assert!(!cursor.read().unwrap());
        cursor.close().unwrap();
        assert_eq!(harness.engine.open_connections(), 0);
        assert!(harness.reporter.is_empty());
    }

    #[rstest]
    fn test_type_mismatch_is_execution_error_and_not_reported(harness: Harness) {
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        cursor.read().unwrap();
        let err = cursor.get_i32(1).unwrap_err();
        assert_eq!(err.kind(), DiagnosticKind::Execution);
        assert!(err.to_string().contains("'name'"));
        assert!(cursor.get_value(17).is_err());
        assert!(cursor.get_ordinal("missing").is_err());
        cursor.close().unwrap();
        assert!(harness.reporter.is_empty());
    }

    #[rstest]
    fn test_chunked_binary_read(harness: Harness) {
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        cursor.read().unwrap();
        assert_eq!(cursor.get_bytes(4, 0, None, 0, 0).unwrap(), 5);

        let mut buffer = [0u8; 4];
        let copied = cursor.get_bytes(4, 3, Some(&mut buffer), 1, 10).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(buffer, [0, 4, 5, 0]);

        let mut chars = ['-'; 2];
        assert_eq!(cursor.get_chars(1, 1, Some(&mut chars), 0, 2).unwrap(), 2);
        assert_eq!(chars, ['n', 'n']);
        cursor.close().unwrap();
    }

    #[rstest]
    fn test_get_values(harness: Harness) {
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        cursor.read().unwrap();
        let mut values = vec![Value::Null; 2];
        assert_eq!(cursor.get_values(&mut values).unwrap(), 2);
        assert_eq!(values, vec![Value::Int32(1), Value::from("Ann")]);
        cursor.close().unwrap();
    }

    #[rstest]
    fn test_outputs_are_placeholders_until_close(harness: Harness) {
        harness.engine.respond(
            "list_people",
            MemResponse::rows(people())
                .with_output("@total", 2)
                .with_output(RETURN_VALUE_PARAM, 0),
        );
        let mut outputs = OutputParams::new();
        outputs.insert("@total".into(), Value::Null);
        let mut cursor = ManagedCursor::open_with_output(
            &harness.source,
            "list_people",
            CommandKind::StoredProcedure,
            None,
            outputs,
        )
        .unwrap();

        cursor.read().unwrap();
        assert_eq!(cursor.output_parameters()["@total"], Value::Null);
        assert_eq!(cursor.return_code(), Some(-1));

        cursor.close().unwrap();
        assert_eq!(cursor.output_parameters()["@total"], Value::Int32(2));
        assert_eq!(cursor.return_code(), Some(0));
    }

    #[rstest]
    fn test_outputs_published_when_stream_is_drained(harness: Harness) {
        harness
            .engine
            .respond("count_people", MemResponse::rows(people()).with_output("@total", 2));
        let mut outputs = OutputParams::new();
        outputs.insert("@total".into(), Value::Int32(0));
        let mut cursor = ManagedCursor::open_with_output(
            &harness.source,
            "SELECT * FROM people; -- count_people",
            CommandKind::Text,
            None,
            outputs,
        )
        .unwrap();
        while cursor.read().unwrap() {}
        assert_eq!(cursor.output_parameters()["@total"], Value::Int32(2));
        assert!(!cursor.output_parameters().contains_key(RETURN_VALUE_PARAM));
        cursor.close().unwrap();
    }

    #[rstest]
    fn test_close_and_dispose_are_idempotent(harness: Harness) {
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(cursor.is_closed());
        assert_eq!(cursor.state(), CursorState::Closed);
        cursor.dispose().unwrap();
        cursor.dispose().unwrap();
        assert_eq!(cursor.state(), CursorState::Disposed);
        assert!(cursor.read().is_err());
        drop(cursor);
        assert!(harness.reporter.is_empty());
        assert_eq!(harness.engine.open_connections(), 0);
    }

    #[rstest]
    fn test_drop_without_close_reports_misuse(harness: Harness) {
        {
            let mut cursor =
                ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                    .unwrap();
            cursor.read().unwrap();
            assert_eq!(harness.engine.open_connections(), 1);
        }
        assert_eq!(harness.engine.open_connections(), 0);
        assert_eq!(harness.reporter.kinds(), vec![DiagnosticKind::DeveloperMisuse]);
        let diagnostic = &harness.reporter.diagnostics()[0];
        assert_eq!(diagnostic.sql.as_deref(), Some("SELECT * FROM people"));
    }

    #[rstest]
    fn test_open_failure_releases_connection(harness: Harness) {
        harness.engine.respond(
            "broken",
            MemResponse::failure(EngineError::server(207, "Invalid column name 'x'")),
        );
        let err = ManagedCursor::open_by_id(&harness.source, "SELECT x FROM broken WHERE id = @id", 3, CommandKind::Text)
            .unwrap_err();
        assert_eq!(err.kind(), DiagnosticKind::Execution);
        assert_eq!(err.diagnostic().parameters, vec![("@id".into(), "3".into())]);
        assert_eq!(harness.engine.open_connections(), 0);
        // Reported once, and no misuse report from the failed cursor.
        assert_eq!(harness.reporter.kinds(), vec![DiagnosticKind::Execution]);
    }

    #[rstest]
    fn test_release_failure_is_resource_error(harness: Harness) {
        harness.engine.fail_on_close(true);
        let mut cursor =
            ManagedCursor::open(&harness.source, "SELECT * FROM people", CommandKind::Text, None)
                .unwrap();
        let err = cursor.close().unwrap_err();
        assert_eq!(err.kind(), DiagnosticKind::Resource);
        assert_eq!(harness.reporter.kinds(), vec![DiagnosticKind::Resource]);
        cursor.close().unwrap();
    }

    #[rstest]
    fn test_open_with_pairs(harness: Harness) {
        let mut cursor = ManagedCursor::open_with_pairs(
            &harness.source,
            "SELECT * FROM people WHERE name = @name AND active = @active",
            CommandKind::Text,
            [("@name", ParamValue::from("Ann")), ("@active", ParamValue::from(true))],
        )
        .unwrap();
        assert_eq!(cursor.command().parameters.len(), 2);
        cursor.close().unwrap();
    }

    #[rstest]
    fn test_with_cursor_closes_on_error(harness: Harness) {
        let result: Result<(), DalcError> = with_cursor(
            &harness.source,
            "SELECT * FROM people",
            CommandKind::Text,
            None,
            |cursor| {
                cursor.read()?;
                cursor.get_guid(0)?;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert_eq!(harness.engine.open_connections(), 0);
        assert!(harness.reporter.is_empty());
    }

    #[rstest]
    fn test_with_cursor_outputs_refreshes_caller_map(harness: Harness) {
        harness.engine.respond(
            "page_people",
            MemResponse::rows(people()).with_output(RETURN_VALUE_PARAM, 4),
        );
        let mut outputs = OutputParams::new();
        let names = with_cursor_outputs(
            &harness.source,
            "page_people",
            CommandKind::StoredProcedure,
            None,
            &mut outputs,
            |cursor| {
                let mut names = Vec::new();
                while cursor.read()? {
                    names.push(cursor.get_typed(1, SqlType::String)?);
                }
                Ok(names)
            },
        )
        .unwrap();
        assert_eq!(names, vec![Value::from("Ann"), Value::Null]);
        assert_eq!(crate::params::return_code(&outputs), Some(4));
    }

    #[test]
    fn test_copy_chunk_bounds() {
        let source = [1u8, 2, 3];
        let mut buffer = [0u8; 2];
        assert_eq!(copy_chunk(&source, 5, Some(&mut buffer), 0, 2), 0);
        assert_eq!(copy_chunk(&source, 0, Some(&mut buffer), 2, 2), 0);
        assert_eq!(copy_chunk(&source, 0, None::<&mut [u8]>, 0, 0), 3);
    }
}
