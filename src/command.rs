//! A described command, ready to run.

use tracing::debug;

use crate::db::{CommandKind, DataSource, Value};
use crate::error::DalcError;
use crate::executor::{execute_non_query, execute_scalar};
use crate::params::{return_code, OutputParams, Params};

/// A command bundled with its purpose, parameters and target database.
///
/// `params_out` is refreshed in place by each run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// What the command is for, used in logs.
    pub purpose: String,
    /// Identifier of the entity the command acts on.
    pub entity_id: Option<String>,
    pub text: String,
    pub kind: CommandKind,
    /// Overrides the data source's connection string when set.
    pub connection_string: Option<String>,
    pub params_in: Params,
    pub params_out: OutputParams,
}

impl CommandSpec {
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params_in = params;
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, placeholder: Value) -> Self {
        self.params_out.insert(name.into(), placeholder);
        self
    }

    fn target(&self, source: &DataSource) -> DataSource {
        match &self.connection_string {
            Some(cs) => source.clone().with_connection_string(cs.clone()),
            None => source.clone(),
        }
    }

    pub fn run_non_query(&mut self, source: &DataSource) -> Result<u64, DalcError> {
        let target = self.target(source);
        debug!(purpose = %self.purpose, entity = ?self.entity_id, "running command");
        let params = (!self.params_in.is_empty()).then_some(&self.params_in);
        execute_non_query(&target, &self.text, self.kind, params, Some(&mut self.params_out))
    }

    pub fn run_scalar(&mut self, source: &DataSource) -> Result<Option<Value>, DalcError> {
        let target = self.target(source);
        debug!(purpose = %self.purpose, entity = ?self.entity_id, "running scalar command");
        let params = (!self.params_in.is_empty()).then_some(&self.params_in);
        execute_scalar(&target, &self.text, self.kind, params, Some(&mut self.params_out))
    }

    /// Status code of the last run of a stored procedure.
    pub fn return_code(&self) -> Option<i64> {
        return_code(&self.params_out)
    }
}
