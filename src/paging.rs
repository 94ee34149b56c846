//! Paged materialization of query results.
//!
//! [`get_data`] composes the SQL for a [`QuerySpec`], streams the cursor once
//! and copies the requested page into a [`ResultTable`] while accumulating the
//! running sums. Two strategies are available:
//!
//! - **Offset** scans the whole result. Counts are exact.
//! - **Windowed** asks the database for one page plus a probe row. The result
//!   count is `offset + rows returned`, a lower bound rather than a total, and
//!   the running sums cover the returned rows only.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{Command, CommandKind, Connection, Cursor, DataSource, EngineError};
use crate::error::{classify, classify_release, DalcError, Diagnostic};
use crate::params::{build_command, Params};
use crate::query::{QueryComposer, QuerySpec, ROW_NUMBER_COLUMN};
use crate::table::{DataColumn, ResultTable};

/// Page requested when the caller sends no page number.
pub const DEFAULT_PAGE: i64 = 1;

/// Page size used when the caller sends none, or a non-positive one.
pub const DEFAULT_ITEMS_PER_PAGE: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PaginationMode {
    Off,
    #[default]
    Offset,
    Windowed {
        #[serde(default)]
        order_by: Option<String>,
    },
}

/// Paging request and result. Updated in place by [`get_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub page: i64,
    pub items_per_page: i64,
    pub mode: PaginationMode,
    pub page_count: i64,
    pub result_count: i64,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE, DEFAULT_ITEMS_PER_PAGE)
    }
}

impl PaginationState {
    /// A non-positive page size falls back to [`DEFAULT_ITEMS_PER_PAGE`].
    pub fn new(page: i64, items_per_page: i64) -> Self {
        Self {
            page,
            items_per_page: normalized_items(items_per_page),
            mode: PaginationMode::Offset,
            page_count: 0,
            result_count: 0,
        }
    }

    /// Build from request text. Empty text takes the defaults.
    pub fn parse(page: &str, items_per_page: &str) -> Result<Self, std::num::ParseIntError> {
        let page = match page.trim() {
            "" => DEFAULT_PAGE,
            text => text.parse()?,
        };
        let items = match items_per_page.trim() {
            "" => DEFAULT_ITEMS_PER_PAGE,
            text => text.parse()?,
        };
        Ok(Self::new(page, items))
    }

    /// Load everything, without paging.
    pub fn disabled() -> Self {
        Self::default().with_mode(PaginationMode::Off)
    }

    pub fn with_mode(mut self, mode: PaginationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.page > 0 && self.mode != PaginationMode::Off
    }

    /// Zero-based index of the first row of the requested page, or `None`
    /// when it does not fit a signed 64-bit integer.
    pub fn offset(&self) -> Option<u64> {
        if self.page <= 0 {
            return Some(0);
        }
        (self.page - 1)
            .checked_mul(normalized_items(self.items_per_page))
            .and_then(|offset| u64::try_from(offset).ok())
    }

    fn items(&self) -> u64 {
        normalized_items(self.items_per_page).unsigned_abs()
    }
}

fn normalized_items(items_per_page: i64) -> i64 {
    if items_per_page <= 0 {
        DEFAULT_ITEMS_PER_PAGE
    } else {
        items_per_page
    }
}

/// Which rows of the stream end up in the table.
#[derive(Debug, Clone, Copy)]
enum Window {
    All,
    Offset { offset: u64, items: u64 },
    /// The query already starts at the page; one extra row is a probe.
    Probe { items: u64 },
}

#[derive(Debug, Default)]
struct Scan {
    scanned: u64,
    appended: u64,
    probed: bool,
}

/// Compose, execute and materialize one page of `spec`.
///
/// Running sums in `spec.sums` are reset and then accumulated; they are also
/// copied into the returned table. A non-positive page size in `state` is
/// replaced by [`DEFAULT_ITEMS_PER_PAGE`].
pub fn get_data(
    source: &DataSource,
    spec: &mut QuerySpec,
    state: &mut PaginationState,
) -> Result<ResultTable, DalcError> {
    state.items_per_page = normalized_items(state.items_per_page);
    let offset = match state.offset() {
        Some(offset) => offset,
        None if !state.is_enabled() => 0,
        None => {
            return Err(source.fail(
                Diagnostic::configuration(format!(
                    "Page {} with {} items per page is out of range",
                    state.page, state.items_per_page
                ))
                .with_sql(spec.template.clone()),
            ));
        }
    };

    let composer = QueryComposer::new(spec);
    let windowed = match &state.mode {
        PaginationMode::Windowed { order_by } if state.is_enabled() => Some(order_by.clone()),
        _ => None,
    };
    let sql = match &windowed {
        Some(order_by) => {
            composer.compose_windowed(offset, state.items(), order_by.as_deref())
        }
        None => composer.compose(),
    }
    .map_err(|e| {
        source.fail(Diagnostic::configuration(e.to_string()).with_sql(spec.template.clone()))
    })?;

    let window = if !state.is_enabled() {
        Window::All
    } else if windowed.is_some() {
        Window::Probe {
            items: state.items(),
        }
    } else {
        Window::Offset {
            offset,
            items: state.items(),
        }
    };

    let (table, scan) = materialize(
        source,
        &sql,
        spec.kind,
        Some(&spec.params),
        window,
        &mut spec.sums,
    )?;

    match window {
        Window::All => state.result_count = 0,
        Window::Offset { items, .. } => {
            state.page_count = count(scan.scanned.div_ceil(items));
            state.result_count = count(scan.scanned);
        }
        Window::Probe { .. } => {
            state.page_count = if scan.probed {
                state.page.saturating_add(1)
            } else {
                state.page
            };
            state.result_count = count(offset.saturating_add(scan.appended));
        }
    }
    debug!(
        page = state.page,
        page_count = state.page_count,
        result_count = state.result_count,
        rows = table.len(),
        "materialized page"
    );
    Ok(table)
}

fn count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Run `sql` as given and load every row.
pub fn get_table(source: &DataSource, sql: &str) -> Result<ResultTable, DalcError> {
    get_table_with(source, sql, CommandKind::Text, None)
}

/// Run `sql` with parameters and load every row.
pub fn get_table_with(
    source: &DataSource,
    sql: &str,
    kind: CommandKind,
    params: Option<&Params>,
) -> Result<ResultTable, DalcError> {
    let mut sums = BTreeMap::new();
    let (table, _) = materialize(source, sql, kind, params, Window::All, &mut sums)?;
    Ok(table)
}

fn materialize(
    source: &DataSource,
    sql: &str,
    kind: CommandKind,
    params: Option<&Params>,
    window: Window,
    sums: &mut BTreeMap<String, Decimal>,
) -> Result<(ResultTable, Scan), DalcError> {
    let command = build_command(source, sql, kind, params, None)?;
    let mut connection = source.open_connection(&command)?;
    let mut cursor = match connection.execute_reader(&command) {
        Ok(cursor) => cursor,
        Err(e) => {
            let _ = connection.close();
            return Err(source.fail(classify(&e, Some(&command))));
        }
    };

    let streamed = stream(cursor.as_mut(), window, sums);
    let released = release(cursor.as_mut(), connection.as_mut());

    match streamed {
        Ok(result) => {
            if !released.is_empty() {
                return Err(source.fail(classify_release(&released, Some(&command))));
            }
            Ok(result)
        }
        Err(failure) => Err(source.fail(failure.into_diagnostic(&command))),
    }
}

fn release(cursor: &mut dyn Cursor, connection: &mut dyn Connection) -> Vec<EngineError> {
    [cursor.close(), connection.close()]
        .into_iter()
        .filter_map(Result::err)
        .collect()
}

/// A failure while streaming, before the command is attached.
enum StreamFailure {
    Engine(EngineError),
    Invalid(Diagnostic),
}

impl StreamFailure {
    fn into_diagnostic(self, command: &Command) -> Diagnostic {
        match self {
            Self::Engine(e) => classify(&e, Some(command)),
            Self::Invalid(d) => d.with_command(command),
        }
    }
}

impl From<EngineError> for StreamFailure {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

fn stream(
    cursor: &mut dyn Cursor,
    window: Window,
    sums: &mut BTreeMap<String, Decimal>,
) -> Result<(ResultTable, Scan), StreamFailure> {
    let mut table = ResultTable::default();
    let mut kept = Vec::new();
    for (ordinal, column) in cursor.schema().iter().enumerate() {
        if column.name.eq_ignore_ascii_case(ROW_NUMBER_COLUMN) {
            continue;
        }
        kept.push(ordinal);
        table.columns.push(DataColumn::from(column));
    }

    let mut sum_ordinals = Vec::with_capacity(sums.len());
    for (name, total) in sums.iter_mut() {
        let ordinal = cursor.ordinal(name).ok_or_else(|| {
            StreamFailure::Invalid(Diagnostic::configuration(format!(
                "Sum column '{}' is not present in the result",
                name
            )))
        })?;
        *total = Decimal::ZERO;
        sum_ordinals.push((name.clone(), ordinal));
    }

    let mut scan = Scan::default();
    while cursor.read()? {
        let append = match window {
            Window::All => true,
            Window::Offset { offset, items } => {
                scan.scanned >= offset && scan.appended < items
            }
            Window::Probe { items } => {
                if scan.appended >= items {
                    scan.probed = true;
                    break;
                }
                true
            }
        };
        scan.scanned += 1;

        if append {
            let row = kept
                .iter()
                .map(|&ordinal| cursor.value(ordinal).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            table.rows.push(row);
            scan.appended += 1;
        }

        // Windowed sums cover the page only; offset and full scans cover every row.
        if append || !matches!(window, Window::Probe { .. }) {
            for (name, ordinal) in &sum_ordinals {
                let value = cursor.value(*ordinal)?;
                let amount = value.to_decimal().ok_or_else(|| {
                    StreamFailure::Invalid(Diagnostic::execution(format!(
                        "Cannot sum column '{}': {} is not numeric",
                        name, value
                    )))
                })?;
                if let Some(total) = sums.get_mut(name) {
                    *total = total.checked_add(amount).ok_or_else(|| {
                        StreamFailure::Invalid(Diagnostic::execution(format!(
                            "Running sum of column '{}' overflowed",
                            name
                        )))
                    })?;
                }
            }
        }
    }

    table.sums = sums.clone();
    Ok((table, scan))
}
