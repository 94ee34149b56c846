//! dalc - data access layer over a relational database client
//!
//! Provides query composition (filters, grouping, sorting, row windows),
//! paginated loading into in-memory tables with running sums, managed
//! forward-only cursors, single-shot command execution and a shared
//! diagnostic model, all on top of a small engine boundary.
//!
//! # Example
//!
//! ```
//! use dalc::{get_data, DataSource, MemEngine, MemResponse, PaginationState, QuerySpec};
//! use dalc::{ResultSet, SqlType, Value};
//!
//! let engine = MemEngine::new();
//! engine.respond_default(MemResponse::rows(
//!     ResultSet::with_columns(&[("id", SqlType::Int32)])
//!         .rows((1..=5).map(|i| vec![Value::Int32(i)])),
//! ));
//! let source = DataSource::memory(engine);
//!
//! let mut spec = QuerySpec::text("SELECT id FROM orders {filter}").filter("status = 'open'");
//! let mut paging = PaginationState::new(2, 2);
//! let table = get_data(&source, &mut spec, &mut paging).unwrap();
//! assert_eq!(table.len(), 2);
//! assert_eq!(paging.result_count, 5);
//! assert_eq!(paging.page_count, 3);
//! ```

pub mod command;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod executor;
pub mod fields;
pub mod paging;
pub mod params;
pub mod query;
pub mod report;
pub mod table;

pub use command::CommandSpec;
pub use config::{ConfigError, DalcConfig, DatabaseConfig, PostgresConfig};
pub use cursor::{with_cursor, with_cursor_outputs, CursorState, ManagedCursor};
pub use db::{CommandKind, DataSource, MemEngine, MemResponse, ResultSet, SqlType, Value};
pub use error::{DalcError, Diagnostic, DiagnosticKind};
pub use executor::{execute_non_query, execute_non_query_by_id, execute_scalar, execute_scalar_by_id};
pub use fields::{FieldDescriptor, SourceDescriptor};
pub use paging::{get_data, get_table, get_table_with, PaginationMode, PaginationState};
pub use params::{OutputParams, ParamBuilder, ParamValue, Params};
pub use query::{ColumnDecl, ComposeError, QueryComposer, QuerySpec};
pub use report::{MemoryReporter, Reporter, TracingReporter};
pub use table::{DataColumn, ResultTable};
