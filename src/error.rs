//! Failure classification and the crate-wide error type.
//!
//! Every engine failure is turned into a [`Diagnostic`] carrying the final SQL
//! text and a snapshot of the bound parameters, reported once through the
//! data source's [`Reporter`](crate::report::Reporter), and returned to the
//! caller as a [`DalcError`].

use std::fmt;

use thiserror::Error;

use crate::db::{Command, EngineError};

/// "Transaction ended in trigger, batch aborted". Benign; stripped from messages.
pub const TRIGGER_ABORT_CODE: i32 = 3609;

/// Engine error numbers meaning the caller lacks a privilege.
pub const PERMISSION_DENIED_CODES: [i32; 2] = [229, 230];

/// SQLSTATE `insufficient_privilege`.
pub const PERMISSION_DENIED_SQLSTATE: &str = "42501";

/// Message shown in place of any privilege-denied engine error.
pub const PERMISSION_DENIED_MESSAGE: &str =
    "У Вас нет прав для данной операции! / You do not have permission for this operation!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Configuration,
    Execution,
    Permission,
    Resource,
    DeveloperMisuse,
}

/// A structured failure report.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Human-readable message, already filtered and translated.
    pub message: String,
    /// Text of the underlying failure, unmodified.
    pub cause: Option<String>,
    /// Final SQL text, when a command had been composed.
    pub sql: Option<String>,
    /// `(name, value)` pairs of the bound parameters.
    pub parameters: Vec<(String, String)>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            sql: None,
            parameters: Vec::new(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Configuration, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Execution, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Resource, message)
    }

    pub fn developer_misuse(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::DeveloperMisuse, message)
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Capture the command's text and parameter snapshot.
    pub fn with_command(mut self, command: &Command) -> Self {
        self.sql = Some(command.text.clone());
        self.parameters = command
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.to_string()))
            .collect();
        self
    }

    /// Multi-line rendering for log sinks.
    pub fn details(&self) -> String {
        let mut out = format!("[{:?}] {}", self.kind, self.message);
        if let Some(cause) = &self.cause {
            if cause != &self.message {
                out.push_str(&format!("\nCause: {}", cause));
            }
        }
        if let Some(sql) = &self.sql {
            out.push_str(&format!("\nSQL: {}", sql));
        }
        for (name, value) in &self.parameters {
            out.push_str(&format!("\n  {} = {}", name, value));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors returned by every public operation of this crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DalcError {
    #[error("Configuration error: {0}")]
    Configuration(Diagnostic),

    #[error("{0}")]
    Execution(Diagnostic),

    #[error("{0}")]
    Permission(Diagnostic),

    #[error("Resource release failed: {0}")]
    Resource(Diagnostic),

    /// Only ever reported, never returned by the library itself.
    #[error("Developer misuse: {0}")]
    DeveloperMisuse(Diagnostic),
}

impl DalcError {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            Self::Configuration(d)
            | Self::Execution(d)
            | Self::Permission(d)
            | Self::Resource(d)
            | Self::DeveloperMisuse(d) => d,
        }
    }

    pub fn kind(&self) -> DiagnosticKind {
        self.diagnostic().kind
    }
}

impl From<Diagnostic> for DalcError {
    fn from(diagnostic: Diagnostic) -> Self {
        match diagnostic.kind {
            DiagnosticKind::Configuration => Self::Configuration(diagnostic),
            DiagnosticKind::Execution => Self::Execution(diagnostic),
            DiagnosticKind::Permission => Self::Permission(diagnostic),
            DiagnosticKind::Resource => Self::Resource(diagnostic),
            DiagnosticKind::DeveloperMisuse => Self::DeveloperMisuse(diagnostic),
        }
    }
}

fn is_permission_denied(number: i32, state: Option<&str>) -> bool {
    PERMISSION_DENIED_CODES.contains(&number) || state == Some(PERMISSION_DENIED_SQLSTATE)
}

/// Compose the user-facing message from an engine failure.
///
/// Sub-errors with [`TRIGGER_ABORT_CODE`] are dropped, privilege-denied
/// sub-errors collapse into a single [`PERMISSION_DENIED_MESSAGE`] line, and the
/// remaining messages are joined with newlines. When nothing survives the
/// filter, the engine's original message is used unchanged.
///
/// Returns the message and whether a privilege-denied sub-error was seen.
pub fn compose_message(error: &EngineError) -> (String, bool) {
    let mut lines: Vec<&str> = Vec::new();
    let mut denied = false;
    for sub in error.sub_errors() {
        if sub.number == TRIGGER_ABORT_CODE {
            continue;
        }
        if is_permission_denied(sub.number, sub.state.as_deref()) {
            if !denied {
                lines.push(PERMISSION_DENIED_MESSAGE);
            }
            denied = true;
        } else {
            lines.push(&sub.message);
        }
    }

    if lines.is_empty() {
        (error.to_string(), false)
    } else {
        (lines.join("\n"), denied)
    }
}

/// Wrap an engine failure into a diagnostic.
pub fn classify(error: &EngineError, command: Option<&Command>) -> Diagnostic {
    let (message, denied) = compose_message(error);
    let kind = if denied {
        DiagnosticKind::Permission
    } else if matches!(error, EngineError::InvalidCommand(_)) {
        DiagnosticKind::Configuration
    } else {
        DiagnosticKind::Execution
    };
    let diagnostic = Diagnostic::new(kind, message).with_cause(error);
    match command {
        Some(command) => diagnostic.with_command(command),
        None => diagnostic,
    }
}

/// Classify a failure that happened while releasing resources.
pub fn classify_release(errors: &[EngineError], command: Option<&Command>) -> Diagnostic {
    let causes: Vec<String> = errors.iter().map(ToString::to_string).collect();
    let diagnostic = Diagnostic::resource(format!(
        "Failed to release database resources: {}",
        causes.join("; ")
    ));
    match command {
        Some(command) => diagnostic.with_command(command),
        None => diagnostic,
    }
}
