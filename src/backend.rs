//! The seam between the queue and the relational engine holding the table.
//!
//! Statement templates use named placeholders (`:pid`, `:id`). Every statement
//! the queue issues has at most one, and values are bound in order of
//! appearance.

use std::fmt;

use async_trait::async_trait;

use crate::types::{Row, Value};

/// SQLSTATE classes a backend reports for transactions aborted by lock
/// contention. `40001` covers MySQL deadlocks (errno 1213), `40P01` is
/// PostgreSQL's `deadlock_detected`.
pub const DEADLOCK_SQLSTATES: &[&str] = &["40001", "40P01"];

/// Structured failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub sqlstate: String,
    pub vendor_code: Option<i64>,
    pub message: String,
}

impl BackendError {
    pub fn new(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: sqlstate.into(),
            vendor_code: None,
            message: message.into(),
        }
    }

    pub fn with_vendor_code(mut self, code: i64) -> Self {
        self.vendor_code = Some(code);
        self
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new("40001", message)
    }

    pub fn is_deadlock(&self) -> bool {
        DEADLOCK_SQLSTATES.contains(&self.sqlstate.as_str())
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQLSTATE[{}]", self.sqlstate)?;
        if let Some(code) = self.vendor_code {
            write!(f, " ({code})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for BackendError {}

#[async_trait]
pub trait Backend: Send + Sync {
    type Statement: Send + Sync;

    /// Compiles a statement template once for repeated execution.
    async fn prepare(&self, sql: &str) -> Result<Self::Statement, BackendError>;

    /// Runs a mutation and returns the number of rows it affected.
    async fn execute(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<u64, BackendError>;

    /// Runs a query and returns its first row, if any.
    async fn fetch_one(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<Option<Row>, BackendError>;
}
