//! Database engine boundary and the `DataSource` handle.
//!
//! This module provides the layer every operation of the crate runs through:
//! - Engine/connection/cursor traits (`backend`)
//! - The closed value and type model (`value`)
//! - A scripted in-memory engine (`mem`) and a PostgreSQL adapter (`postgres`)
//!
//! # Architecture
//!
//! A [`DataSource`] pairs an [`Engine`] with a connection string, a command
//! timeout and a [`Reporter`]. Every call opens its own connection and closes
//! it before returning (or hands it to a `ManagedCursor`, which owns it until
//! closed). There is no pooling and no sharing of connections.

mod backend;
pub mod mem;
#[cfg(feature = "backend-postgres")]
pub mod postgres;
mod value;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub use backend::{
    BufferedCursor, ColumnSchema, Command, CommandKind, Connection, ConnectionState, Cursor,
    Direction, Engine, EngineError, Execution, ParameterBinding, ResultSet, SubError,
};
pub use mem::{MemEngine, MemResponse};
pub use value::{is_unset_datetime, unset_datetime, SqlType, Value};

use crate::error::{classify, Diagnostic, DalcError};
use crate::report::{Reporter, TracingReporter};

/// Command timeout applied when the configuration does not set one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to run commands against one database.
#[derive(Clone)]
pub struct DataSource {
    engine: Arc<dyn Engine>,
    connection_string: String,
    reporter: Arc<dyn Reporter>,
    command_timeout: Option<Duration>,
}

impl DataSource {
    pub fn new(engine: Arc<dyn Engine>, connection_string: impl Into<String>) -> Self {
        Self {
            engine,
            connection_string: connection_string.into(),
            reporter: Arc::new(TracingReporter),
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }

    /// Data source over a scripted in-memory engine.
    pub fn memory(engine: MemEngine) -> Self {
        Self::new(Arc::new(engine), "memory")
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Same engine, reporter and timeout, against another database.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// `None` disables the timeout.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Report a diagnostic once and turn it into the caller-facing error.
    pub(crate) fn fail(&self, diagnostic: Diagnostic) -> DalcError {
        self.reporter.report(&diagnostic);
        DalcError::from(diagnostic)
    }

    /// Create and open a fresh connection for `command`.
    pub(crate) fn open_connection(&self, command: &Command) -> Result<Box<dyn Connection>, DalcError> {
        debug!(
            backend = self.engine.backend_name(),
            kind = ?command.kind,
            sql = %command.text,
            "opening connection"
        );
        let mut connection = self
            .engine
            .connect(&self.connection_string)
            .map_err(|e| self.fail(classify(&e, Some(command))))?;
        connection
            .open()
            .map_err(|e| self.fail(classify(&e, Some(command))))?;
        Ok(connection)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("backend", &self.engine.backend_name())
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
