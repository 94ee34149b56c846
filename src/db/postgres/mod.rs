//! PostgreSQL backend implementation.
//!
//! A synchronous adapter over the `postgres` crate. Commands are written with
//! `@name` parameters; before execution they are rewritten to PostgreSQL's
//! positional `$n` placeholders, and stored procedures are invoked with named
//! argument notation.
//!
//! Rows are fetched eagerly and served through a [`BufferedCursor`], so the
//! underlying client is idle as soon as `execute_reader` returns.

mod conversion;

use postgres::types::ToSql;
use postgres::{Client, NoTls, Statement};
use tracing::{debug, trace};

use super::backend::{
    BufferedCursor, ColumnSchema, Command, CommandKind, Connection, ConnectionState, Cursor,
    Direction, Engine, EngineError, Execution, ResultSet,
};
use conversion::{from_pg_error, read_row, sql_type_of, to_sql, unsupported_type, SqlParam};

/// Engine creating PostgreSQL connections.
///
/// Connection strings use the `postgres` crate's format, either key/value
/// (`host=localhost user=app dbname=orders`) or URL
/// (`postgres://app@localhost/orders`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresEngine;

impl PostgresEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for PostgresEngine {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn Connection>, EngineError> {
        Ok(Box::new(PostgresConnection {
            connection_string: connection_string.to_string(),
            client: None,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "PostgreSQL"
    }
}

/// One PostgreSQL session. The client exists only while the connection is open.
pub struct PostgresConnection {
    connection_string: String,
    client: Option<Client>,
}

impl PostgresConnection {
    fn client(&mut self) -> Result<&mut Client, EngineError> {
        self.client.as_mut().ok_or(EngineError::NotOpen)
    }

    /// Apply the command timeout, translate the text and bind the parameters.
    fn prepare(
        &mut self,
        command: &Command,
        form: ProcedureForm,
    ) -> Result<(Statement, Vec<SqlParam>), EngineError> {
        let translated = translate(command, form)?;
        trace!(sql = %translated.sql, "translated command");
        let timeout_ms = command.timeout.map(|t| t.as_millis()).unwrap_or(0);
        let client = self.client()?;
        client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_ms))
            .map_err(|e| from_pg_error(e, command.timeout))?;
        let statement = client
            .prepare(&translated.sql)
            .map_err(|e| from_pg_error(e, command.timeout))?;

        let params = translated
            .order
            .iter()
            .zip(statement.params())
            .map(|(&idx, ty)| {
                let binding = &command.parameters[idx];
                to_sql(&binding.value, &binding.name, ty)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((statement, params))
    }
}

fn as_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref()).collect()
}

fn has_outputs(command: &Command) -> bool {
    command
        .parameters
        .iter()
        .any(|p| p.direction == Direction::Output)
}

impl Connection for PostgresConnection {
    fn open(&mut self) -> Result<(), EngineError> {
        if self.client.is_none() {
            let client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| from_pg_error(e, None))?;
            debug!("connected to PostgreSQL");
            self.client = Some(client);
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        match self.client {
            Some(_) => ConnectionState::Open,
            None => ConnectionState::Closed,
        }
    }

    fn execute_reader(&mut self, command: &Command) -> Result<Box<dyn Cursor>, EngineError> {
        // Rows come from `SELECT * FROM proc(...)`; there is no separate output channel.
        if has_outputs(command) {
            return Err(EngineError::InvalidCommand(format!(
                "output parameters are not supported when reading rows from '{}'",
                command.text
            )));
        }
        let (statement, params) = self.prepare(command, ProcedureForm::Select)?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| {
                let data_type = sql_type_of(c.type_()).ok_or_else(|| unsupported_type(c.type_()))?;
                let mut schema = ColumnSchema::new(c.name(), data_type);
                schema.type_name = c.type_().name().to_string();
                Ok(schema)
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let rows = self
            .client()?
            .query(&statement, &as_refs(&params))
            .map_err(|e| from_pg_error(e, command.timeout))?;
        let mut set = ResultSet::new(columns);
        for row in &rows {
            set.rows.push(read_row(row)?);
        }
        debug!(rows = set.rows.len(), "query returned");
        Ok(Box::new(BufferedCursor::new(
            vec![set],
            -1,
            command.default_outputs(),
        )))
    }

    fn execute_non_query(&mut self, command: &Command) -> Result<Execution, EngineError> {
        let (statement, params) = self.prepare(command, ProcedureForm::Call)?;
        let mut outputs = command.default_outputs();

        if command.kind == CommandKind::StoredProcedure && has_outputs(command) {
            // INOUT arguments come back as the single row of the CALL.
            let row = self
                .client()?
                .query_opt(&statement, &as_refs(&params))
                .map_err(|e| from_pg_error(e, command.timeout))?;
            if let Some(row) = row {
                for (idx, column) in row.columns().iter().enumerate() {
                    let name = format!("@{}", column.name());
                    if let Some(slot) = outputs
                        .iter_mut()
                        .find(|(n, _)| n.eq_ignore_ascii_case(&name))
                    {
                        slot.1 = conversion::read_value(&row, idx)?;
                    }
                }
            }
            return Ok(Execution {
                rows_affected: 0,
                outputs,
            });
        }

        let rows_affected = self
            .client()?
            .execute(&statement, &as_refs(&params))
            .map_err(|e| from_pg_error(e, command.timeout))?;
        Ok(Execution {
            rows_affected,
            outputs,
        })
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if let Some(client) = self.client.take() {
            client.close().map_err(|e| from_pg_error(e, None))?;
        }
        Ok(())
    }
}

/// How a stored procedure is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcedureForm {
    /// `CALL proc(...)`, for procedures run for their effect.
    Call,
    /// `SELECT * FROM proc(...)`, for set-returning functions.
    Select,
}

/// SQL ready for `prepare`, plus the parameter index bound to each `$n`.
#[derive(Debug, PartialEq)]
struct Translated {
    sql: String,
    order: Vec<usize>,
}

fn translate(command: &Command, form: ProcedureForm) -> Result<Translated, EngineError> {
    match command.kind {
        CommandKind::Text => translate_text(command),
        CommandKind::StoredProcedure => Ok(translate_procedure(command, form)),
    }
}

fn translate_procedure(command: &Command, form: ProcedureForm) -> Translated {
    let mut order = Vec::new();
    let mut args = Vec::new();
    for (idx, binding) in command.parameters.iter().enumerate() {
        if binding.direction == Direction::ReturnValue {
            continue;
        }
        order.push(idx);
        let name = binding.name.trim_start_matches('@');
        args.push(format!("{} => ${}", name, order.len()));
    }
    let call = format!("{}({})", command.text, args.join(", "));
    let sql = match form {
        ProcedureForm::Call => format!("CALL {}", call),
        ProcedureForm::Select => format!("SELECT * FROM {}", call),
    };
    Translated { sql, order }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrite `@name` parameters to `$n`, numbered by first appearance.
///
/// Quoted strings, quoted identifiers and `--` comments are copied verbatim.
/// An `@` directly after an identifier character is not a parameter.
fn translate_text(command: &Command) -> Result<Translated, EngineError> {
    let chars: Vec<char> = command.text.chars().collect();
    let mut sql = String::with_capacity(command.text.len());
    let mut order: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .map(|p| i + 1 + p)
                    .unwrap_or(chars.len() - 1);
                sql.extend(&chars[i..=end]);
                i = end + 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&n| n == '\n')
                    .map(|p| i + p)
                    .unwrap_or(chars.len());
                sql.extend(&chars[i..end]);
                i = end;
            }
            '@' if chars.get(i + 1).is_some_and(|&n| is_ident_start(n))
                && !(i > 0 && (is_ident_char(chars[i - 1]) || chars[i - 1] == '@')) =>
            {
                let len = chars[i + 1..]
                    .iter()
                    .take_while(|&&n| is_ident_char(n))
                    .count();
                let name: String = chars[i..i + 1 + len].iter().collect();
                let idx = command
                    .parameters
                    .iter()
                    .position(|p| {
                        p.direction != Direction::ReturnValue && p.name.eq_ignore_ascii_case(&name)
                    })
                    .ok_or_else(|| EngineError::Unsupported {
                        what: "unbound parameter",
                        name: name.clone(),
                    })?;
                let position = match order.iter().position(|&o| o == idx) {
                    Some(p) => p + 1,
                    None => {
                        order.push(idx);
                        order.len()
                    }
                };
                sql.push_str(&format!("${}", position));
                i += 1 + len;
            }
            _ => {
                sql.push(c);
                i += 1;
            }
        }
    }
    Ok(Translated { sql, order })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::ParameterBinding;
    use crate::db::value::Value;
    use rstest::rstest;

    fn text(sql: &str, names: &[&str]) -> Command {
        let mut command = Command::new(sql, CommandKind::Text);
        for name in names {
            command
                .parameters
                .push(ParameterBinding::input(*name, Value::Int32(1)));
        }
        command
    }

    #[rstest]
    #[case(
        "SELECT * FROM orders WHERE id = @id AND owner = @Owner",
        "SELECT * FROM orders WHERE id = $1 AND owner = $2"
    )]
    #[case("SELECT @id + @id", "SELECT $1 + $1")]
    #[case("SELECT '@id', \"@owner\" FROM t", "SELECT '@id', \"@owner\" FROM t")]
    #[case("SELECT 1 -- @id\nFROM t", "SELECT 1 -- @id\nFROM t")]
    #[case("SELECT mail@id FROM t", "SELECT mail@id FROM t")]
    #[case("SELECT @ -5", "SELECT @ -5")]
    fn test_translate_text(#[case] sql: &str, #[case] expected: &str) {
        let command = text(sql, &["@id", "@owner"]);
        assert_eq!(translate_text(&command).unwrap().sql, expected);
    }

    #[test]
    fn test_placeholders_follow_first_appearance() {
        let command = text("SELECT @owner, @id, @owner", &["@id", "@owner"]);
        let translated = translate_text(&command).unwrap();
        assert_eq!(translated.sql, "SELECT $1, $2, $1");
        assert_eq!(translated.order, vec![1, 0]);
    }

    #[test]
    fn test_unbound_parameter_is_rejected() {
        let command = text("SELECT @missing", &["@id"]);
        let err = translate_text(&command).unwrap_err();
        assert_eq!(
            err,
            EngineError::Unsupported {
                what: "unbound parameter",
                name: "@missing".into(),
            }
        );
    }

    #[test]
    fn test_reader_rejects_output_bindings_before_connecting() {
        let mut connection = PostgresEngine::new().connect("host=localhost").unwrap();
        let mut command = Command::new("list_orders", CommandKind::StoredProcedure);
        command
            .parameters
            .push(ParameterBinding::output("@total", Value::Null));
        let err = connection.execute_reader(&command).err().unwrap();
        assert!(matches!(err, EngineError::InvalidCommand(_)), "{err:?}");
    }

    #[test]
    fn test_unterminated_quote_is_copied() {
        let command = text("SELECT 'abc", &[]);
        assert_eq!(translate_text(&command).unwrap().sql, "SELECT 'abc");
    }

    #[test]
    fn test_procedure_forms_skip_return_value() {
        let mut command = Command::new("archive_order", CommandKind::StoredProcedure);
        command
            .parameters
            .push(ParameterBinding::input("@id", Value::Int32(7)));
        command
            .parameters
            .push(ParameterBinding::output("@archived_at", Value::Null));
        command
            .parameters
            .push(ParameterBinding::return_value("@RETURN_VALUE"));

        let call = translate(&command, ProcedureForm::Call).unwrap();
        assert_eq!(call.sql, "CALL archive_order(id => $1, archived_at => $2)");
        assert_eq!(call.order, vec![0, 1]);

        let select = translate(&command, ProcedureForm::Select).unwrap();
        assert_eq!(
            select.sql,
            "SELECT * FROM archive_order(id => $1, archived_at => $2)"
        );
        assert!(has_outputs(&command));
    }

    #[test]
    fn test_connection_starts_closed() {
        let mut connection = PostgresEngine::new().connect("host=localhost").unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        let command = Command::new("SELECT 1", CommandKind::Text);
        assert_eq!(
            connection.execute_non_query(&command).unwrap_err(),
            EngineError::NotOpen
        );
        assert!(connection.close().is_ok());
    }
}
