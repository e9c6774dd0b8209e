//! MySQL backend over a `sqlx` connection pool.
//!
//! ## Error Mapping
//!
//! | sqlx error | BackendError |
//! |------------|--------------|
//! | `Database` | SQLSTATE from the server, MySQL errno as vendor code, server message |
//! | anything else (pool closed, I/O, decode) | SQLSTATE `HY000`, no vendor code |
//!
//! InnoDB reports deadlocks as SQLSTATE `40001` / errno 1213, which the queue
//! retries.
//!
//! sqlx always connects with `CLIENT_FOUND_ROWS`, so an `UPDATE` reports the
//! rows it matched rather than the rows it changed. An unconditional
//! `UPDATE t SET c = NULL` is therefore narrowed to `WHERE c IS NOT NULL` at
//! prepare time, which makes both counts the same.

use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlArguments, MySqlDatabaseError, MySqlPool, MySqlRow},
    query::Query,
    Column, Executor, MySql, Row as _, ValueRef,
};

use crate::{
    backend::{Backend, BackendError},
    types::{Row, Value},
};

#[derive(Debug, Clone)]
pub struct MySqlBackend {
    pool: MySqlPool,
}

/// Statement text with named placeholders rewritten to `?`.
#[derive(Debug, Clone)]
pub struct MySqlStatement {
    sql: String,
}

impl MySqlBackend {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

/// Replaces `:name` placeholders with `?`. Quoted literals are left alone.
fn positional(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"' | '`') => {
                quote = Some(c);
                out.push(c);
            }
            (None, ':') if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                while chars
                    .peek()
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_')
                {
                    chars.next();
                }
                out.push('?');
            }
            (None, c) => out.push(c),
        }
    }

    out
}

/// Adds `WHERE c IS NOT NULL` to an `UPDATE t SET c = NULL` that has no
/// `WHERE` clause. Other statements are returned unchanged.
fn changed_rows_only(sql: &str) -> String {
    let trimmed = sql.trim_end();
    let upper = trimmed.to_ascii_uppercase();

    let column = upper
        .strip_prefix("UPDATE ")
        .filter(|rest| !rest.contains(" WHERE ") && !rest.contains(','))
        .and_then(|rest| rest.find(" SET ").map(|at| "UPDATE ".len() + at + " SET ".len()))
        .and_then(|start| {
            upper[start..]
                .strip_suffix(" = NULL")
                .map(|_| trimmed[start..trimmed.len() - " = NULL".len()].trim())
        });

    match column {
        Some(column) if !column.is_empty() && !column.contains(char::is_whitespace) => {
            format!("{trimmed} WHERE {column} IS NOT NULL")
        }
        _ => sql.to_string(),
    }
}

fn map_sqlx_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db) => {
            let vendor_code = db
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| i64::from(e.number()));
            BackendError {
                sqlstate: db.code().map(|c| c.into_owned()).unwrap_or_else(|| "HY000".to_string()),
                vendor_code,
                message: db.message().to_string(),
            }
        }
        other => BackendError::new("HY000", other.to_string()),
    }
}

fn bind<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[Value],
) -> Query<'q, MySql, MySqlArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

fn decode_row(row: &MySqlRow) -> Result<Row, BackendError> {
    let mut out = Row::new();

    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index).map_err(map_sqlx_error)?;
        let value = if raw.is_null() {
            Value::Null
        } else if let Ok(i) = row.try_get::<i64, _>(index) {
            Value::Int(i)
        } else if let Ok(u) = row.try_get::<u64, _>(index) {
            i64::try_from(u).map(Value::Int).unwrap_or_else(|_| Value::Text(u.to_string()))
        } else if let Ok(f) = row.try_get::<f64, _>(index) {
            Value::Float(f)
        } else if let Ok(s) = row.try_get::<String, _>(index) {
            Value::Text(s)
        } else {
            Value::Bytes(row.try_get::<Vec<u8>, _>(index).map_err(map_sqlx_error)?)
        };
        out.push(column.name(), value);
    }

    Ok(out)
}

#[async_trait]
impl Backend for MySqlBackend {
    type Statement = MySqlStatement;

    async fn prepare(&self, sql: &str) -> Result<MySqlStatement, BackendError> {
        let sql = changed_rows_only(&positional(sql));
        // Server-side prepare catches unknown tables and columns up front.
        // sqlx caches the statement per connection when it is executed.
        (&self.pool).prepare(sql.as_str()).await.map_err(map_sqlx_error)?;
        Ok(MySqlStatement { sql })
    }

    async fn execute(
        &self,
        statement: &MySqlStatement,
        params: &[Value],
    ) -> Result<u64, BackendError> {
        let result = bind(sqlx::query(&statement.sql), params)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn fetch_one(
        &self,
        statement: &MySqlStatement,
        params: &[Value],
    ) -> Result<Option<Row>, BackendError> {
        let row = bind(sqlx::query(&statement.sql), params)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(decode_row).transpose()
    }
}
