//! Materialized query results.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::db::{ColumnSchema, SqlType, Value};

/// Default name of a materialized table.
pub const DEFAULT_TABLE_NAME: &str = "Data";

/// A result column, shaped by the engine's schema rather than by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataColumn {
    pub name: String,
    pub data_type: SqlType,
    pub unique: bool,
    pub allow_null: bool,
    pub auto_increment: bool,
}

impl From<&ColumnSchema> for DataColumn {
    fn from(schema: &ColumnSchema) -> Self {
        Self {
            name: schema.name.clone(),
            data_type: schema.data_type,
            unique: schema.is_unique,
            allow_null: schema.allow_null,
            auto_increment: schema.is_auto_increment,
        }
    }
}

/// Rows copied out of a cursor, plus the running totals gathered on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub name: String,
    pub columns: Vec<DataColumn>,
    pub rows: Vec<Vec<Value>>,
    pub sums: BTreeMap<String, Decimal>,
}

impl Default for ResultTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_NAME)
    }
}

impl ResultTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            sums: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column position by name (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<&Value> {
        match self.column_index(column) {
            Some(index) => self.rows.iter().filter_map(|r| r.get(index)).collect(),
            None => Vec::new(),
        }
    }

    pub fn sum(&self, column: &str) -> Option<Decimal> {
        self.sums.get(column).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultTable {
        let mut table = ResultTable::default();
        table.columns.push(DataColumn::from(&ColumnSchema::new("id", SqlType::Int32)));
        table.columns.push(DataColumn::from(&ColumnSchema::new("Name", SqlType::String)));
        table.rows.push(vec![Value::Int32(1), Value::from("a")]);
        table.rows.push(vec![Value::Int32(2), Value::from("b")]);
        table
    }

    #[test]
    fn test_lookup_by_name() {
        let table = sample();
        assert_eq!(table.name, "Data");
        assert_eq!(table.column_index("name"), Some(1));
        assert_eq!(table.value(1, "ID"), Some(&Value::Int32(2)));
        assert_eq!(table.value(5, "id"), None);
        assert_eq!(table.column_values("name").len(), 2);
        assert!(table.column_values("missing").is_empty());
    }

    #[test]
    fn test_column_metadata_copied_from_schema() {
        let mut schema = ColumnSchema::new("id", SqlType::Int64);
        schema.is_unique = true;
        schema.allow_null = false;
        schema.is_auto_increment = true;
        let column = DataColumn::from(&schema);
        assert!(column.unique && column.auto_increment && !column.allow_null);
        assert_eq!(column.data_type, SqlType::Int64);
    }
}
