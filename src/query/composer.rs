//! SQL template rewriting.
//!
//! Rewrites are applied in a fixed order: filter injection, grouping, then
//! either the sort clause or the row-numbered page window.

use thiserror::Error;

use super::spec::{QuerySpec, FILTER_SLOT};
use crate::db::CommandKind;

/// Row-number column added by the windowed rewrite.
pub const ROW_NUMBER_COLUMN: &str = "__dalc_row";

/// Ordering used by the window when nothing else is available.
const NEUTRAL_ORDER: &str = "(SELECT NULL)";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("Query template must contain exactly one {{filter}} slot, found {found}")]
    FilterSlot { found: usize },

    #[error("Windowed pagination requires a text command, got {kind:?}")]
    WindowedRequiresText { kind: CommandKind },

    #[error("Page window starting after row {offset} with {items} rows is out of range")]
    WindowOutOfRange { offset: u64, items: u64 },
}

/// Builds the final SQL text for a [`QuerySpec`].
pub struct QueryComposer<'a> {
    spec: &'a QuerySpec,
}

impl<'a> QueryComposer<'a> {
    pub fn new(spec: &'a QuerySpec) -> Self {
        Self { spec }
    }

    /// Filtered, grouped and sorted SQL.
    pub fn compose(&self) -> Result<String, ComposeError> {
        let sql = self.grouped()?;
        Ok(self.append_sort(sql))
    }

    /// SQL restricted to one page plus a probe row.
    ///
    /// Rows `offset+1 ..= offset+items+1` of the numbered query are returned in
    /// row-number order. The last row number must fit a signed 64-bit integer. The window is ordered by `order_by` when given, else
    /// by the effective sort, else by a neutral expression.
    pub fn compose_windowed(
        &self,
        offset: u64,
        items: u64,
        order_by: Option<&str>,
    ) -> Result<String, ComposeError> {
        if !self.spec.is_text() {
            return Err(ComposeError::WindowedRequiresText {
                kind: self.spec.kind,
            });
        }
        let last = offset
            .checked_add(items)
            .and_then(|n| n.checked_add(1))
            .filter(|&n| i64::try_from(n).is_ok())
            .ok_or(ComposeError::WindowOutOfRange { offset, items })?;
        let inner = self.grouped()?;
        let order = order_by
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| self.spec.effective_sort());
        let order = if order.is_empty() { NEUTRAL_ORDER } else { order };
        Ok(wrap_window(&inner, order, offset + 1, last))
    }

    fn grouped(&self) -> Result<String, ComposeError> {
        let sql = self.inject_filters()?;
        Ok(self.wrap_grouping(sql))
    }

    fn inject_filters(&self) -> Result<String, ComposeError> {
        let template = &self.spec.template;
        let found = template.matches(FILTER_SLOT).count();
        let allowed = match self.spec.kind {
            CommandKind::Text => found == 1,
            CommandKind::StoredProcedure => found <= 1,
        };
        if !allowed {
            return Err(ComposeError::FilterSlot { found });
        }

        let clause = if self.spec.filters.is_empty() {
            String::new()
        } else {
            format!("\nWHERE ({})", self.spec.filters.join(" AND "))
        };
        Ok(template.replacen(FILTER_SLOT, &clause, 1))
    }

    fn wrap_grouping(&self, sql: String) -> String {
        let spec = self.spec;
        if !spec.is_text() || spec.columns.is_empty() || !spec.is_grouped() {
            return sql;
        }
        let flagged = |name: &str| spec.group_by.get(name).copied().unwrap_or(false);

        let select: Vec<String> = spec
            .columns
            .iter()
            .map(|c| {
                if flagged(&c.name) {
                    c.name.clone()
                } else if c.sql_type.is_textual() {
                    format!("'' {}", c.name)
                } else if c.sql_type.is_decimal() {
                    format!("SUM({0}) {0}", c.name)
                } else {
                    format!("NULL {}", c.name)
                }
            })
            .collect();

        // Declared columns first, then flagged names without a declaration.
        let mut group: Vec<&str> = spec
            .columns
            .iter()
            .filter(|c| flagged(&c.name))
            .map(|c| c.name.as_str())
            .collect();
        for (name, flag) in &spec.group_by {
            if *flag && !group.contains(&name.as_str()) {
                group.push(name);
            }
        }

        format!(
            "SELECT {}\nFROM (\n{}\n) TGroup\nGROUP BY {}",
            select.join(", "),
            sql,
            group.join(", ")
        )
    }

    fn append_sort(&self, sql: String) -> String {
        let sort = self.spec.effective_sort();
        if !self.spec.is_text() || sort.is_empty() {
            return sql;
        }
        format!("{}\nORDER BY {}", sql, sort)
    }
}

fn wrap_window(inner: &str, order: &str, first: u64, last: u64) -> String {
    format!(
        "SELECT * FROM (\nSELECT TWin.*, ROW_NUMBER() OVER (ORDER BY {order}) AS {col}\nFROM (\n{inner}\n) TWin\n) TPage\nWHERE {col} BETWEEN {first} AND {last}\nORDER BY {col}",
        col = ROW_NUMBER_COLUMN,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlType;
    use rstest::rstest;

    #[rstest]
    #[case(vec![], "SELECT * FROM t ")]
    #[case(vec!["a = 1"], "SELECT * FROM t \nWHERE (a = 1)")]
    #[case(vec!["a = 1", "b = 2", "c LIKE 'x%'"], "SELECT * FROM t \nWHERE (a = 1 AND b = 2 AND c LIKE 'x%')")]
    fn test_filter_injection(#[case] filters: Vec<&str>, #[case] expected: &str) {
        let mut spec = QuerySpec::text("SELECT * FROM t {filter}");
        for f in filters {
            spec = spec.filter(f);
        }
        let sql = QueryComposer::new(&spec).compose().unwrap();
        assert_eq!(sql, expected);
        assert!(!sql.contains(FILTER_SLOT));
        assert!(sql.matches("WHERE").count() <= 1);
    }

    #[rstest]
    #[case("SELECT * FROM t", 0)]
    #[case("SELECT * FROM t {filter} UNION SELECT * FROM u {filter}", 2)]
    fn test_text_template_needs_one_slot(#[case] template: &str, #[case] found: usize) {
        let spec = QuerySpec::text(template);
        let err = QueryComposer::new(&spec).compose().unwrap_err();
        assert_eq!(err, ComposeError::FilterSlot { found });
    }

    #[test]
    fn test_procedure_name_may_omit_slot() {
        let spec = QuerySpec::procedure("get_orders").filter("ignored = 1").sort("id");
        let sql = QueryComposer::new(&spec).compose().unwrap();
        assert_eq!(sql, "get_orders");
    }

    #[test]
    fn test_grouping_rewrite() {
        let spec = QuerySpec::text("SELECT A, B, C FROM t {filter}")
            .column("A", SqlType::Int32)
            .column("B", SqlType::String)
            .column("C", SqlType::Decimal)
            .group("A");
        let sql = QueryComposer::new(&spec).compose().unwrap();
        assert_eq!(
            sql,
            "SELECT A, '' B, SUM(C) C\nFROM (\nSELECT A, B, C FROM t \n) TGroup\nGROUP BY A"
        );
    }

    #[test]
    fn test_grouping_nulls_other_types() {
        let spec = QuerySpec::text("SELECT * FROM t {filter}")
            .column("region", SqlType::String)
            .column("day", SqlType::DateTime)
            .column("qty", SqlType::Int32)
            .group("region")
            .filter("qty > 0")
            .sort("region");
        let sql = QueryComposer::new(&spec).compose().unwrap();
        assert!(sql.starts_with("SELECT region, NULL day, NULL qty\nFROM (\n"));
        assert!(sql.contains("\nWHERE (qty > 0)\n) TGroup\nGROUP BY region"));
        assert!(sql.ends_with("\nORDER BY region"));
    }

    #[test]
    fn test_grouping_skipped_without_flags_or_columns() {
        let unflagged = QuerySpec::text("SELECT * FROM t {filter}").column("a", SqlType::Int32);
        assert_eq!(
            QueryComposer::new(&unflagged).compose().unwrap(),
            "SELECT * FROM t "
        );
        let undeclared = QuerySpec::text("SELECT * FROM t {filter}").group("a");
        assert_eq!(
            QueryComposer::new(&undeclared).compose().unwrap(),
            "SELECT * FROM t "
        );
    }

    #[rstest]
    #[case("", "", "SELECT 1 ")]
    #[case("", "id", "SELECT 1 \nORDER BY id")]
    #[case("name DESC", "id", "SELECT 1 \nORDER BY name DESC")]
    fn test_sort_injection(#[case] sort: &str, #[case] default_sort: &str, #[case] expected: &str) {
        let spec = QuerySpec::text("SELECT 1 {filter}")
            .sort(sort)
            .default_sort(default_sort);
        assert_eq!(QueryComposer::new(&spec).compose().unwrap(), expected);
    }

    #[test]
    fn test_windowed_rewrite_moves_sort_into_window() {
        let spec = QuerySpec::text("SELECT id FROM t {filter}")
            .filter("id > 0")
            .default_sort("id");
        let sql = QueryComposer::new(&spec)
            .compose_windowed(10, 10, None)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (\nSELECT TWin.*, ROW_NUMBER() OVER (ORDER BY id) AS __dalc_row\nFROM (\nSELECT id FROM t \nWHERE (id > 0)\n) TWin\n) TPage\nWHERE __dalc_row BETWEEN 11 AND 21\nORDER BY __dalc_row"
        );
    }

    #[rstest]
    #[case(Some("created DESC"), "", "ORDER BY created DESC")]
    #[case(None, "", "ORDER BY (SELECT NULL)")]
    #[case(Some("  "), "name", "ORDER BY name")]
    fn test_window_ordering(
        #[case] order_by: Option<&str>,
        #[case] sort: &str,
        #[case] expected: &str,
    ) {
        let spec = QuerySpec::text("SELECT * FROM t {filter}").sort(sort);
        let sql = QueryComposer::new(&spec)
            .compose_windowed(0, 5, order_by)
            .unwrap();
        assert!(sql.contains(&format!("OVER ({})", expected)));
        assert!(sql.contains("BETWEEN 1 AND 6"));
    }

    #[test]
    fn test_windowed_rejects_procedures() {
        let spec = QuerySpec::procedure("get_orders");
        let err = QueryComposer::new(&spec)
            .compose_windowed(0, 2, None)
            .unwrap_err();
        assert_eq!(
            err,
            ComposeError::WindowedRequiresText {
                kind: CommandKind::StoredProcedure
            }
        );
    }

    #[rstest]
    #[case(u64::MAX, 1)]
    #[case(i64::MAX as u64 - 1, 1)]
    #[case(1, u64::MAX)]
    fn test_window_past_row_number_range_is_rejected(#[case] offset: u64, #[case] items: u64) {
        let spec = QuerySpec::text("SELECT * FROM t {filter}");
        let err = QueryComposer::new(&spec)
            .compose_windowed(offset, items, None)
            .unwrap_err();
        assert_eq!(err, ComposeError::WindowOutOfRange { offset, items });
    }

    #[test]
    fn test_window_ending_at_largest_row_number() {
        let spec = QuerySpec::text("SELECT * FROM t {filter}");
        let sql = QueryComposer::new(&spec)
            .compose_windowed(i64::MAX as u64 - 2, 1, None)
            .unwrap();
        assert!(sql.contains(&format!("AND {}", i64::MAX)));
    }
}
