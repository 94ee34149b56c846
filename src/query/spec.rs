use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::db::{CommandKind, SqlType};
use crate::params::{ParamValue, Params};

/// Placeholder substituted with the filter clause (or nothing).
pub const FILTER_SLOT: &str = "{filter}";

/// A declared result column, used by the grouping rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDecl {
    pub name: String,
    pub sql_type: SqlType,
}

/// Everything the composer and the materializer need for one call.
///
/// # Examples
///
/// ```ignore
/// let spec = QuerySpec::text("SELECT id, name, amount FROM orders {filter}")
///     .param("@status", 2)
///     .filter("status = @status")
///     .default_sort("id")
///     .sum("amount");
/// ```
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub template: String,
    pub kind: CommandKind,
    pub params: Params,
    pub filters: Vec<String>,
    pub sort: String,
    pub default_sort: String,
    /// Declared columns, in output order.
    pub columns: Vec<ColumnDecl>,
    pub group_by: BTreeMap<String, bool>,
    /// Running totals, reset and accumulated by each materialization.
    pub sums: BTreeMap<String, Decimal>,
}

impl QuerySpec {
    pub fn new(template: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            template: template.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn text(template: impl Into<String>) -> Self {
        Self::new(template, CommandKind::Text)
    }

    /// Stored procedure by name; the name may omit the filter slot.
    pub fn procedure(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::StoredProcedure)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn filter(mut self, fragment: impl Into<String>) -> Self {
        self.filters.push(fragment.into());
        self
    }

    pub fn sort(mut self, expr: impl Into<String>) -> Self {
        self.sort = expr.into();
        self
    }

    pub fn default_sort(mut self, expr: impl Into<String>) -> Self {
        self.default_sort = expr.into();
        self
    }

    pub fn column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnDecl {
            name: name.into(),
            sql_type,
        });
        self
    }

    /// Flag a column for `GROUP BY`.
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.group_by.insert(name.into(), true);
        self
    }

    /// Accumulate a running total of `name` while materializing.
    pub fn sum(mut self, name: impl Into<String>) -> Self {
        self.sums.insert(name.into(), Decimal::ZERO);
        self
    }

    /// User sort, falling back to the default sort. Empty when neither is set.
    pub fn effective_sort(&self) -> &str {
        if self.sort.trim().is_empty() {
            self.default_sort.trim()
        } else {
            self.sort.trim()
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == CommandKind::Text
    }

    pub(crate) fn is_grouped(&self) -> bool {
        self.group_by.values().any(|flag| *flag)
    }

    pub fn total(&self, column: &str) -> Option<Decimal> {
        self.sums.get(column).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_sort_prefers_user_sort() {
        let spec = QuerySpec::text("x").default_sort("id");
        assert_eq!(spec.effective_sort(), "id");
        let spec = spec.sort("name DESC");
        assert_eq!(spec.effective_sort(), "name DESC");
        assert_eq!(QuerySpec::text("x").effective_sort(), "");
    }

    #[test]
    fn test_group_flags() {
        let mut spec = QuerySpec::text("x");
        assert!(!spec.is_grouped());
        spec.group_by.insert("a".into(), false);
        assert!(!spec.is_grouped());
        let spec = spec.group("b");
        assert!(spec.is_grouped());
    }

    #[test]
    fn test_sum_starts_at_zero() {
        let spec = QuerySpec::procedure("report_totals").sum("amount");
        assert!(!spec.is_text());
        assert_eq!(spec.total("amount"), Some(Decimal::ZERO));
        assert_eq!(spec.total("missing"), None);
    }
}
