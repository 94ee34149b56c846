//! Engine boundary: connection, command, forward cursor and schema primitives.
//!
//! Everything above this module talks to the database only through these
//! traits. Two implementations ship with the crate: the scripted in-memory
//! engine (`db::mem`) and the synchronous PostgreSQL adapter
//! (`db::postgres`, feature `backend-postgres`).

use std::time::Duration;

use thiserror::Error;

use super::value::{SqlType, Value};

/// How the engine should interpret [`Command::text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Raw SQL text.
    #[default]
    Text,
    /// The text is the name of a stored procedure.
    StoredProcedure,
}

/// Direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    ReturnValue,
}

/// A parameter as handed to the engine, after coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub value: Value,
    /// Declared type when the caller bound a tagged string value.
    pub declared: Option<SqlType>,
    pub direction: Direction,
    /// Buffer size for output values; `None` means unconstrained.
    pub size: Option<usize>,
}

impl ParameterBinding {
    pub fn input(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            declared: None,
            direction: Direction::Input,
            size: None,
        }
    }

    pub fn output(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            declared: None,
            direction: Direction::Output,
            size: None,
        }
    }

    pub fn return_value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
            declared: None,
            direction: Direction::ReturnValue,
            size: None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.direction, Direction::Output | Direction::ReturnValue)
    }
}

/// A fully bound command, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub kind: CommandKind,
    /// Execution aborts with [`EngineError::Timeout`] after this long.
    pub timeout: Option<Duration>,
    pub parameters: Vec<ParameterBinding>,
}

impl Command {
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
            timeout: None,
            parameters: Vec::new(),
        }
    }

    /// Look up a bound parameter by name (case-insensitive, like the engines).
    pub fn parameter(&self, name: &str) -> Option<&ParameterBinding> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Output values an engine reports when it has nothing better: the bound
    /// value for output parameters and status `0` for the return value.
    pub fn default_outputs(&self) -> Vec<(String, Value)> {
        self.parameters
            .iter()
            .filter_map(|p| match p.direction {
                Direction::Input => None,
                Direction::Output => Some((p.name.clone(), p.value.clone())),
                Direction::ReturnValue => Some((p.name.clone(), Value::Int32(0))),
            })
            .collect()
    }
}

/// Column metadata as described by the executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: SqlType,
    /// Engine-native type name, for `get_data_type_name`.
    pub type_name: String,
    pub is_unique: bool,
    pub allow_null: bool,
    pub is_auto_increment: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: SqlType) -> Self {
        Self {
            name: name.into(),
            data_type,
            type_name: data_type.label().to_string(),
            is_unique: false,
            allow_null: true,
            is_auto_increment: false,
        }
    }
}

/// One error reported by the engine. A single failure may carry several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubError {
    /// Engine error number (0 when the engine has none).
    pub number: i32,
    /// SQLSTATE, when the engine reports one.
    pub state: Option<String>,
    pub message: String,
}

impl SubError {
    pub fn new(number: i32, message: impl Into<String>) -> Self {
        Self {
            number,
            state: None,
            message: message.into(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Engine-level failure types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{message}")]
    Server { message: String, errors: Vec<SubError> },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection is not open")]
    NotOpen,

    #[error("Cursor is closed")]
    CursorClosed,

    #[error("No current row; call read() first")]
    NoCurrentRow,

    #[error("Column ordinal {ordinal} is out of range (field count {count})")]
    OrdinalOutOfRange { ordinal: usize, count: usize },

    /// The engine cannot run the command as bound.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unsupported {what}: {name}")]
    Unsupported { what: &'static str, name: String },

    #[error("Cannot convert {found} to {expected} for '{target}'")]
    InvalidCast {
        target: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl EngineError {
    /// Build a server error from a single engine message.
    pub fn server(number: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Server {
            errors: vec![SubError::new(number, message.clone())],
            message,
        }
    }

    pub fn sub_errors(&self) -> &[SubError] {
        match self {
            Self::Server { errors, .. } => errors,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Result of a non-query execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub rows_affected: u64,
    /// Final output and return values, keyed by parameter name.
    pub outputs: Vec<(String, Value)>,
}

/// A database engine: a factory for connections.
pub trait Engine: Send + Sync {
    /// Create a connection for the given connection string. The connection
    /// is returned closed; callers open it right before executing.
    fn connect(&self, connection_string: &str) -> Result<Box<dyn Connection>, EngineError>;

    /// Whether output parameters may be bound with an unconstrained size.
    fn supports_unbounded_output(&self) -> bool {
        true
    }

    /// Get the backend name for logging/debugging.
    fn backend_name(&self) -> &'static str;
}

/// A single physical connection. Never shared between cursors.
pub trait Connection: Send {
    fn open(&mut self) -> Result<(), EngineError>;

    fn state(&self) -> ConnectionState;

    /// Execute a command and return a forward-only cursor over its results.
    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn Cursor>, EngineError>;

    /// Execute a command that returns no rows.
    fn execute_non_query(&mut self, command: &Command) -> Result<Execution, EngineError>;

    /// Close the connection. Closing a closed connection is a no-op.
    fn close(&mut self) -> Result<(), EngineError>;
}

/// Forward-only, read-only cursor over one or more result sets.
pub trait Cursor: Send {
    /// Schema of the current result set.
    fn schema(&self) -> &[ColumnSchema];

    /// Advance to the next row; `false` once the current result set is exhausted.
    fn read(&mut self) -> Result<bool, EngineError>;

    /// Advance to the next result set; `false` when there is none.
    fn next_result(&mut self) -> Result<bool, EngineError>;

    /// Value of the given column in the current row.
    fn value(&self, ordinal: usize) -> Result<&Value, EngineError>;

    fn has_rows(&self) -> bool;

    fn records_affected(&self) -> i64;

    /// Nesting depth of the current row.
    fn depth(&self) -> usize {
        0
    }

    fn is_closed(&self) -> bool;

    fn close(&mut self) -> Result<(), EngineError>;

    /// Output and return values. `None` until the engine has finalized them,
    /// which happens once every result set is drained or the cursor is closed.
    fn outputs(&self) -> Option<&[(String, Value)]>;

    fn field_count(&self) -> usize {
        self.schema().len()
    }

    /// Ordinal of a column by name (case-insensitive).
    fn ordinal(&self, name: &str) -> Option<usize> {
        self.schema()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A fully materialized result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a result set from `(name, type)` pairs.
    pub fn with_columns(columns: &[(&str, SqlType)]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|(name, ty)| ColumnSchema::new(*name, *ty))
                .collect(),
        )
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn rows(mut self, rows: impl IntoIterator<Item = Vec<Value>>) -> Self {
        self.rows.extend(rows);
        self
    }
}

/// Cursor over result sets already held in memory.
///
/// Both shipped engines buffer rows client-side, so they share this cursor.
/// Output values are published once the last result set is drained or the
/// cursor is closed, mirroring engines that only finalize them at end of stream.
#[derive(Debug)]
pub struct BufferedCursor {
    sets: Vec<ResultSet>,
    set_index: usize,
    row_index: Option<usize>,
    records_affected: i64,
    pending_outputs: Vec<(String, Value)>,
    finalized: Option<Vec<(String, Value)>>,
    closed: bool,
}

impl BufferedCursor {
    pub fn new(sets: Vec<ResultSet>, records_affected: i64, outputs: Vec<(String, Value)>) -> Self {
        Self {
            sets,
            set_index: 0,
            row_index: None,
            records_affected,
            pending_outputs: outputs,
            finalized: None,
            closed: false,
        }
    }

    fn current_set(&self) -> Option<&ResultSet> {
        self.sets.get(self.set_index)
    }

    fn finalize(&mut self) {
        if self.finalized.is_none() {
            self.finalized = Some(std::mem::take(&mut self.pending_outputs));
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::CursorClosed)
        } else {
            Ok(())
        }
    }
}

impl Cursor for BufferedCursor {
    fn schema(&self) -> &[ColumnSchema] {
        self.current_set().map(|s| s.columns.as_slice()).unwrap_or(&[])
    }

    fn read(&mut self) -> Result<bool, EngineError> {
        self.ensure_open()?;
        let len = self.current_set().map(|s| s.rows.len()).unwrap_or(0);
        let next = self.row_index.map(|i| i + 1).unwrap_or(0);
        if next < len {
            self.row_index = Some(next);
            return Ok(true);
        }
        self.row_index = Some(len);
        if self.set_index + 1 >= self.sets.len() {
            self.finalize();
        }
        Ok(false)
    }

    fn next_result(&mut self) -> Result<bool, EngineError> {
        self.ensure_open()?;
        if self.set_index + 1 < self.sets.len() {
            self.set_index += 1;
            self.row_index = None;
            Ok(true)
        } else {
            self.set_index = self.sets.len();
            self.finalize();
            Ok(false)
        }
    }

    fn value(&self, ordinal: usize) -> Result<&Value, EngineError> {
        self.ensure_open()?;
        let set = self.current_set().ok_or(EngineError::NoCurrentRow)?;
        let row = self
            .row_index
            .and_then(|i| set.rows.get(i))
            .ok_or(EngineError::NoCurrentRow)?;
        row.get(ordinal).ok_or(EngineError::OrdinalOutOfRange {
            ordinal,
            count: set.columns.len(),
        })
    }

    fn has_rows(&self) -> bool {
        self.current_set().is_some_and(|s| !s.rows.is_empty())
    }

    fn records_affected(&self) -> i64 {
        self.records_affected
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.closed = true;
        self.finalize();
        Ok(())
    }

    fn outputs(&self) -> Option<&[(String, Value)]> {
        self.finalized.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sets() -> BufferedCursor {
        let first = ResultSet::with_columns(&[("id", SqlType::Int32)])
            .row(vec![Value::Int32(1)])
            .row(vec![Value::Int32(2)]);
        let second = ResultSet::with_columns(&[("name", SqlType::String)])
            .row(vec![Value::Str("a".into())]);
        BufferedCursor::new(
            vec![first, second],
            -1,
            vec![("@out".into(), Value::Int32(42))],
        )
    }

    #[test]
    fn test_read_walks_rows_then_result_sets() {
        let mut cursor = two_sets();
        assert!(cursor.read().unwrap());
        assert_eq!(cursor.value(0).unwrap(), &Value::Int32(1));
        assert!(cursor.read().unwrap());
        assert!(!cursor.read().unwrap());
        assert!(cursor.next_result().unwrap());
        assert_eq!(cursor.schema()[0].name, "name");
        assert!(cursor.read().unwrap());
        assert_eq!(cursor.value(0).unwrap(), &Value::Str("a".into()));
        assert!(!cursor.next_result().unwrap());
    }

    #[test]
    fn test_outputs_published_only_after_drain() {
        let mut cursor = two_sets();
        assert!(cursor.outputs().is_none());
        while cursor.read().unwrap() {}
        assert!(cursor.outputs().is_none(), "second result set still pending");
        cursor.next_result().unwrap();
        while cursor.read().unwrap() {}
        assert_eq!(cursor.outputs().unwrap(), &[("@out".to_string(), Value::Int32(42))]);
    }

    #[test]
    fn test_close_finalizes_outputs() {
        let mut cursor = two_sets();
        cursor.close().unwrap();
        assert!(cursor.outputs().is_some());
        assert_eq!(cursor.read(), Err(EngineError::CursorClosed));
    }

    #[test]
    fn test_value_before_read_is_an_error() {
        let cursor = two_sets();
        assert_eq!(cursor.value(0), Err(EngineError::NoCurrentRow));
    }

    #[test]
    fn test_ordinal_lookup_is_case_insensitive() {
        let cursor = two_sets();
        assert_eq!(cursor.ordinal("ID"), Some(0));
        assert_eq!(cursor.ordinal("missing"), None);
    }

    #[test]
    fn test_default_outputs() {
        let mut command = Command::new("proc", CommandKind::StoredProcedure);
        command.parameters.push(ParameterBinding::input("@a", Value::Int32(1)));
        command.parameters.push(ParameterBinding::output("@b", Value::Str("x".into())));
        command.parameters.push(ParameterBinding::return_value("@RETURN_VALUE"));
        assert_eq!(
            command.default_outputs(),
            vec![
                ("@b".to_string(), Value::Str("x".into())),
                ("@RETURN_VALUE".to_string(), Value::Int32(0)),
            ]
        );
    }
}
