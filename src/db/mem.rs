//! Scripted in-memory engine.
//!
//! `MemEngine` does not parse SQL. Callers register responses keyed by a
//! substring of the command text; the first matching script answers, falling
//! back to a default response. Every executed command is recorded so tests
//! can assert on the composed SQL and the bound parameters, and the engine
//! counts open connections so that leaked cursors are detectable.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{
    BufferedCursor, Command, Connection, ConnectionState, Cursor, Engine, EngineError, Execution,
    ResultSet,
};
use super::value::Value;

/// What the engine answers for a matching command.
#[derive(Debug, Clone, Default)]
pub struct MemResponse {
    result_sets: Vec<ResultSet>,
    outputs: Vec<(String, Value)>,
    rows_affected: u64,
    failure: Option<EngineError>,
}

impl MemResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with a single result set.
    pub fn rows(set: ResultSet) -> Self {
        Self::new().with_result_set(set)
    }

    /// Fail the execution with the given engine error.
    pub fn failure(error: EngineError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn with_result_set(mut self, set: ResultSet) -> Self {
        self.result_sets.push(set);
        self
    }

    /// Publish a final value for an output or return parameter.
    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.push((name.into(), value.into()));
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = rows;
        self
    }

    /// Scripted outputs override the command's defaults; names the command
    /// did not bind are dropped.
    fn outputs_for(&self, command: &Command) -> Vec<(String, Value)> {
        command
            .default_outputs()
            .into_iter()
            .map(|(name, default)| {
                let value = self
                    .outputs
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(&name))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(default);
                (name, value)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Script {
    needle: String,
    response: MemResponse,
}

#[derive(Debug)]
struct MemState {
    scripts: Vec<Script>,
    fallback: MemResponse,
    executed: Vec<Command>,
    open_connections: usize,
    connect_failure: Option<EngineError>,
    fail_on_close: bool,
    unbounded_output: bool,
}

impl Default for MemState {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            fallback: MemResponse::default(),
            executed: Vec::new(),
            open_connections: 0,
            connect_failure: None,
            fail_on_close: false,
            unbounded_output: true,
        }
    }
}

/// In-memory engine with scripted responses.
///
/// Cloning shares the script and the execution log.
#[derive(Debug, Clone, Default)]
pub struct MemEngine {
    state: Arc<Mutex<MemState>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        lock(&self.state)
    }

    /// Answer commands whose text contains `needle` with `response`.
    pub fn respond(&self, needle: impl Into<String>, response: MemResponse) -> &Self {
        self.state().scripts.push(Script {
            needle: needle.into(),
            response,
        });
        self
    }

    /// Answer every command no script matches.
    pub fn respond_default(&self, response: MemResponse) -> &Self {
        self.state().fallback = response;
        self
    }

    /// Make every subsequent `open()` fail.
    pub fn fail_connect(&self, error: EngineError) -> &Self {
        self.state().connect_failure = Some(error);
        self
    }

    /// Make connection `close()` report a failure (the connection still closes).
    pub fn fail_on_close(&self, fail: bool) -> &Self {
        self.state().fail_on_close = fail;
        self
    }

    /// Simulate an engine whose output buffers must have a fixed size.
    pub fn without_unbounded_output(self) -> Self {
        self.state().unbounded_output = false;
        self
    }

    /// Every command executed so far, in order.
    pub fn executed(&self) -> Vec<Command> {
        self.state().executed.clone()
    }

    pub fn last_command(&self) -> Option<Command> {
        self.state().executed.last().cloned()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }
}

impl Engine for MemEngine {
    fn connect(&self, _connection_string: &str) -> Result<Box<dyn Connection>, EngineError> {
        Ok(Box::new(MemConnection {
            state: Arc::clone(&self.state),
            open: false,
        }))
    }

    fn supports_unbounded_output(&self) -> bool {
        self.state().unbounded_output
    }

    fn backend_name(&self) -> &'static str {
        "Memory"
    }
}

struct MemConnection {
    state: Arc<Mutex<MemState>>,
    open: bool,
}

impl MemConnection {
    /// Record the command and pick its response.
    fn dispatch(&mut self, command: &Command) -> Result<MemResponse, EngineError> {
        if !self.open {
            return Err(EngineError::NotOpen);
        }
        let mut state = lock(&self.state);
        state.executed.push(command.clone());
        let response = state
            .scripts
            .iter()
            .find(|s| command.text.contains(&s.needle))
            .map(|s| s.response.clone())
            .unwrap_or_else(|| state.fallback.clone());
        match response.failure {
            Some(error) => Err(error),
            None => Ok(response),
        }
    }
}

impl Connection for MemConnection {
    fn open(&mut self) -> Result<(), EngineError> {
        if self.open {
            return Ok(());
        }
        let mut state = lock(&self.state);
        if let Some(error) = &state.connect_failure {
            return Err(error.clone());
        }
        state.open_connections += 1;
        self.open = true;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.open {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn Cursor>, EngineError> {
        let response = self.dispatch(command)?;
        let outputs = response.outputs_for(command);
        Ok(Box::new(BufferedCursor::new(
            response.result_sets,
            response.rows_affected as i64,
            outputs,
        )))
    }

    fn execute_non_query(&mut self, command: &Command) -> Result<Execution, EngineError> {
        let response = self.dispatch(command)?;
        Ok(Execution {
            rows_affected: response.rows_affected,
            outputs: response.outputs_for(command),
        })
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let mut state = lock(&self.state);
        state.open_connections = state.open_connections.saturating_sub(1);
        if state.fail_on_close {
            return Err(EngineError::Connection {
                message: "simulated failure while closing the connection".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        if self.open {
            let mut state = lock(&self.state);
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

fn lock(state: &Mutex<MemState>) -> MutexGuard<'_, MemState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
