//! Field and source metadata for a mapping layer.
//!
//! These descriptors carry no behaviour of their own beyond resolving column
//! ordinals against an open cursor and reading a field by its declared type.

use std::collections::BTreeMap;

use crate::cursor::ManagedCursor;
use crate::db::{SqlType, Value};
use crate::error::DalcError;

/// How one entity field maps to a result column and a command parameter.
///
/// A primary key differs from a regular field only in which attributes are set.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub field_name: String,
    /// Parameter bound when saving; empty means `@<field_name>`.
    pub param_name: String,
    pub sql_type: SqlType,
    pub primary_key: bool,
    pub updatable: bool,
    /// Links the entity to its parent.
    pub parent_link: bool,
    /// Resolved by [`resolve_ordinals`].
    pub ordinal: Option<usize>,
    /// Used for a primary key whose column is NULL.
    pub default_value: Option<Value>,
}

impl FieldDescriptor {
    /// Primary-key field: not updatable, with a default for new entities.
    pub fn primary_key(field_name: impl Into<String>, sql_type: SqlType, default: Value) -> Self {
        Self {
            field_name: field_name.into(),
            param_name: String::new(),
            sql_type,
            primary_key: true,
            updatable: false,
            parent_link: false,
            ordinal: None,
            default_value: Some(default),
        }
    }

    /// Regular, updatable field.
    pub fn field(field_name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            field_name: field_name.into(),
            param_name: String::new(),
            sql_type,
            primary_key: false,
            updatable: true,
            parent_link: false,
            ordinal: None,
            default_value: None,
        }
    }

    pub fn param(mut self, param_name: impl Into<String>) -> Self {
        self.param_name = param_name.into();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn parent_link(mut self) -> Self {
        self.parent_link = true;
        self
    }

    /// The parameter name to bind, with the `@` prefix.
    pub fn parameter_name(&self) -> String {
        match self.param_name.as_str() {
            "" => format!("@{}", self.field_name),
            name if name.starts_with('@') => name.to_string(),
            name => format!("@{}", name),
        }
    }
}

/// Where an entity is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescriptor {
    pub table_name: String,
    /// Query or procedure loading one record.
    pub record_source: String,
    /// Query or procedure loading a list of records.
    pub records_source: String,
}

impl SourceDescriptor {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    pub fn with_sources(
        table_name: impl Into<String>,
        record_source: impl Into<String>,
        records_source: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            record_source: record_source.into(),
            records_source: records_source.into(),
        }
    }

    /// Single-record source, falling back to the table.
    pub fn record(&self) -> &str {
        if self.record_source.is_empty() {
            &self.table_name
        } else {
            &self.record_source
        }
    }

    /// List source, falling back to the table.
    pub fn records(&self) -> &str {
        if self.records_source.is_empty() {
            &self.table_name
        } else {
            &self.records_source
        }
    }
}

/// Fill in each field's ordinal from the cursor's current schema.
pub fn resolve_ordinals(
    cursor: &ManagedCursor,
    fields: &mut [FieldDescriptor],
) -> Result<(), DalcError> {
    for field in fields.iter_mut() {
        field.ordinal = Some(cursor.get_ordinal(&field.field_name)?);
    }
    Ok(())
}

/// Read one field of the current row by its declared type.
pub fn read_field(cursor: &ManagedCursor, field: &FieldDescriptor) -> Result<Value, DalcError> {
    let ordinal = match field.ordinal {
        Some(ordinal) => ordinal,
        None => cursor.get_ordinal(&field.field_name)?,
    };
    let value = cursor.get_typed(ordinal, field.sql_type)?;
    match (&value, &field.default_value) {
        (Value::Null, Some(default)) if field.primary_key => Ok(default.clone()),
        _ => Ok(value),
    }
}

/// Read every field of the current row, keyed by field name.
pub fn read_record(
    cursor: &ManagedCursor,
    fields: &[FieldDescriptor],
) -> Result<BTreeMap<String, Value>, DalcError> {
    fields
        .iter()
        .map(|field| Ok((field.field_name.clone(), read_field(cursor, field)?)))
        .collect()
}
