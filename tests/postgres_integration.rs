//! Integration tests against a live PostgreSQL instance.
//!
//! Run with: cargo test --features postgres-tests
//!
//! Prerequisites:
//! 1. A running PostgreSQL server
//! 2. Create test database: `createdb -U postgres dalc_test`
//! 3. Optionally point `DATABASE_URL` at another database

#![cfg(feature = "postgres-tests")]

use std::sync::Arc;
use std::time::Duration;

use dalc::db::postgres::PostgresEngine;
use dalc::params::RETURN_VALUE_PARAM;
use dalc::{
    execute_non_query, execute_scalar, get_data, get_table, with_cursor, CommandKind, DataSource,
    DiagnosticKind, MemoryReporter, OutputParams, PaginationMode, PaginationState, ParamBuilder,
    QuerySpec, SqlType, Value,
};
use rust_decimal::Decimal;
use serial_test::serial;

/// Fallback connection string for a local instance.
const PG_CONNECTION: &str = "host=localhost user=postgres dbname=dalc_test";

fn source() -> (DataSource, MemoryReporter) {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| PG_CONNECTION.to_string());
    let reporter = MemoryReporter::new();
    let source = DataSource::new(Arc::new(PostgresEngine::new()), url)
        .with_reporter(Arc::new(reporter.clone()));
    (source, reporter)
}

fn run(source: &DataSource, sql: &str) {
    execute_non_query(source, sql, CommandKind::Text, None, None).unwrap();
}

/// Fresh `dalc_orders` table with ten rows, amounts 1.5 .. 15.0.
fn seed(source: &DataSource) {
    run(source, "DROP TABLE IF EXISTS dalc_orders");
    run(
        source,
        "CREATE TABLE dalc_orders (id INT PRIMARY KEY, owner TEXT NOT NULL, amount NUMERIC(10,2) NOT NULL)",
    );
    for id in 1..=10 {
        let params = ParamBuilder::new()
            .with("@id", id)
            .with("@owner", if id % 2 == 0 { "even" } else { "odd" })
            .with("@amount", Decimal::new(i64::from(id) * 15, 1))
            .build();
        execute_non_query(
            source,
            "INSERT INTO dalc_orders (id, owner, amount) VALUES (@id, @owner, @amount)",
            CommandKind::Text,
            Some(&params),
            None,
        )
        .unwrap();
    }
}

#[test]
#[serial]
fn test_offset_page_with_filter_and_sum() {
    let (source, reporter) = source();
    seed(&source);
    let mut spec = QuerySpec::text("SELECT id, owner, amount FROM dalc_orders {filter}")
        .filter("owner = @owner")
        .param("@owner", "even")
        .default_sort("id")
        .sum("amount");
    let mut state = PaginationState::new(2, 2);

    let table = get_data(&source, &mut spec, &mut state).unwrap();

    assert_eq!(table.column_values("id"), vec![&Value::Int32(6), &Value::Int32(8)]);
    assert_eq!(state.result_count, 5);
    assert_eq!(state.page_count, 3);
    assert_eq!(spec.total("amount"), Some(Decimal::new(450, 1)));
    assert!(reporter.is_empty());
}

#[test]
#[serial]
fn test_windowed_page() {
    let (source, _) = source();
    seed(&source);
    let mut spec = QuerySpec::text("SELECT id, amount FROM dalc_orders {filter}").default_sort("id");
    let mut state = PaginationState::new(2, 4).with_mode(PaginationMode::Windowed { order_by: None });

    let table = get_data(&source, &mut spec, &mut state).unwrap();

    assert_eq!(table.column_names(), vec!["id", "amount"]);
    assert_eq!(table.len(), 4);
    assert_eq!(table.value(0, "id"), Some(&Value::Int32(5)));
    assert_eq!(state.page_count, 3);
    assert_eq!(state.result_count, 8);
}

#[test]
#[serial]
fn test_grouped_totals() {
    let (source, _) = source();
    seed(&source);
    let mut spec = QuerySpec::text("SELECT owner, id, amount FROM dalc_orders {filter}")
        .column("owner", SqlType::String)
        .column("id", SqlType::Int32)
        .column("amount", SqlType::Decimal)
        .group("owner")
        .sort("owner");

    let table = get_data(&source, &mut spec, &mut PaginationState::disabled()).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table.value(0, "owner"), Some(&Value::from("even")));
    assert_eq!(table.value(0, "amount"), Some(&Value::Decimal(Decimal::new(450, 1))));
}

#[test]
#[serial]
fn test_scalar_and_cursor_reads() {
    let (source, _) = source();
    seed(&source);
    let params = ParamBuilder::new().with("@id", 3).build();
    let owner = execute_scalar(
        &source,
        "SELECT owner FROM dalc_orders WHERE id = @id",
        CommandKind::Text,
        Some(&params),
        None,
    )
    .unwrap();
    assert_eq!(owner, Some(Value::from("odd")));

    let total = with_cursor(
        &source,
        "SELECT amount FROM dalc_orders ORDER BY id",
        CommandKind::Text,
        None,
        |cursor| {
            let mut total = Decimal::ZERO;
            while cursor.read()? {
                total += cursor.get_decimal(0)?;
            }
            Ok(total)
        },
    )
    .unwrap();
    assert_eq!(total, Decimal::new(825, 1));
}

#[test]
#[serial]
fn test_procedure_inout_parameter() {
    let (source, _) = source();
    run(
        &source,
        "CREATE OR REPLACE PROCEDURE dalc_double(INOUT value INT) LANGUAGE plpgsql AS $$ BEGIN value := value * 2; END $$",
    );
    let mut outputs = OutputParams::new();
    outputs.insert("@value".into(), Value::Int32(21));

    execute_non_query(&source, "dalc_double", CommandKind::StoredProcedure, None, Some(&mut outputs))
        .unwrap();

    assert_eq!(outputs["@value"], Value::Int32(42));
    assert_eq!(outputs[RETURN_VALUE_PARAM], Value::Int32(0));
}

#[test]
#[serial]
fn test_timeout_and_server_errors() {
    let (source, reporter) = source();
    let slow = source.clone().with_command_timeout(Some(Duration::from_millis(100)));
    let err = get_table(&slow, "SELECT 1 AS done FROM pg_sleep(2)").unwrap_err();
    assert_eq!(err.kind(), DiagnosticKind::Execution);

    let err = get_table(&source, "SELECT * FROM dalc_missing_table").unwrap_err();
    assert_eq!(err.kind(), DiagnosticKind::Execution);
    assert!(err.diagnostic().message.contains("dalc_missing_table"));
    assert_eq!(reporter.len(), 2);
}
