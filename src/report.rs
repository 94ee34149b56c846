//! Diagnostic sinks.
//!
//! The library never installs a `tracing` subscriber; applications decide
//! where [`TracingReporter`] output goes.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, warn};

use crate::error::{Diagnostic, DiagnosticKind};

/// Receives every terminal failure exactly once.
pub trait Reporter: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Default sink: emits diagnostics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, diagnostic: &Diagnostic) {
        let sql = diagnostic.sql.as_deref().unwrap_or("");
        match diagnostic.kind {
            DiagnosticKind::DeveloperMisuse | DiagnosticKind::Resource => warn!(
                kind = ?diagnostic.kind,
                sql,
                "{}",
                diagnostic.details()
            ),
            _ => error!(
                kind = ?diagnostic.kind,
                sql,
                parameters = diagnostic.parameters.len(),
                "{}",
                diagnostic.details()
            ),
        }
    }
}

/// Sink that keeps diagnostics in memory; clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct MemoryReporter {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.diagnostics().iter().map(|d| d.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, diagnostic: &Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic.clone());
    }
}
