//! An in-process table that answers the queue's statements the way a
//! relational engine would. Useful for tests and single-host setups that have
//! no database at hand.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError},
    config::{Projection, QueueConfig, ID_ALIAS},
    types::{JobId, Row, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatement {
    Claim,
    Load,
    Remove,
    UnassignAll,
    UnassignProcess,
}

#[derive(Debug, Clone)]
struct StoredRow {
    pid: Value,
    columns: Row,
}

#[derive(Default)]
struct Table {
    rows: BTreeMap<i64, StoredRow>,
    next_id: i64,
}

/// Clones share the same table, like connections to one database.
#[derive(Clone)]
pub struct MemoryBackend {
    table: Arc<RwLock<Table>>,
    config: Arc<QueueConfig>,
}

impl MemoryBackend {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            table: Arc::new(RwLock::new(Table {
                rows: BTreeMap::new(),
                next_id: 1,
            })),
            config: Arc::new(config),
        }
    }

    /// Inserts an unowned row and returns its id.
    pub async fn enqueue(&self, payload: Row) -> JobId {
        let mut table = self.table.write().await;
        let id = table.next_id;
        table.next_id += 1;
        table.rows.insert(
            id,
            StoredRow {
                pid: Value::Null,
                columns: payload,
            },
        );
        JobId(id)
    }

    /// Current owner of a row: `None` if the row is gone, `Some(Value::Null)`
    /// if it is unclaimed.
    pub async fn owner(&self, id: JobId) -> Option<Value> {
        let table = self.table.read().await;
        table.rows.get(&id.0).map(|row| row.pid.clone())
    }

    /// Sets the owner of a row directly, as another scheduler would.
    pub async fn set_owner(&self, id: JobId, pid: impl Into<Value>) -> bool {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&id.0) {
            Some(row) => {
                row.pid = pid.into();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.rows.is_empty()
    }

    fn project(&self, id: i64, row: &StoredRow) -> Result<Row, BackendError> {
        let config = &*self.config;
        let lookup = |name: &str| -> Option<Value> {
            if name == config.id_column {
                Some(Value::Int(id))
            } else if name == config.pid_column {
                Some(row.pid.clone())
            } else {
                row.columns.get(name).cloned()
            }
        };

        let mut out = Row::new();
        match &config.projection {
            Projection::All => {
                out.push(config.id_column.as_str(), id);
                out.push(config.pid_column.as_str(), row.pid.clone());
                for (name, value) in row.columns.iter() {
                    out.push(name, value.clone());
                }
            }
            Projection::Columns(columns) => {
                for column in columns {
                    let value = lookup(&column.source).ok_or_else(|| {
                        BackendError::new(
                            "42S22",
                            format!("Unknown column '{}' in 'field list'", column.source),
                        )
                        .with_vendor_code(1054)
                    })?;
                    out.push(column.alias.as_str(), value);
                }
            }
        }
        out.push(ID_ALIAS, id);

        Ok(out)
    }
}

fn param(params: &[Value]) -> Result<&Value, BackendError> {
    params
        .first()
        .ok_or_else(|| BackendError::new("HY093", "Invalid parameter number"))
}

#[async_trait]
impl Backend for MemoryBackend {
    type Statement = MemoryStatement;

    async fn prepare(&self, sql: &str) -> Result<MemoryStatement, BackendError> {
        let statements = self.config.statements();

        [
            (statements.claim, MemoryStatement::Claim),
            (statements.load, MemoryStatement::Load),
            (statements.remove, MemoryStatement::Remove),
            (statements.unassign_all, MemoryStatement::UnassignAll),
            (statements.unassign_process, MemoryStatement::UnassignProcess),
        ]
        .into_iter()
        .find_map(|(text, statement)| (text == sql).then_some(statement))
        .ok_or_else(|| {
            BackendError::new("42000", format!("unsupported statement: {sql}")).with_vendor_code(1064)
        })
    }

    #[instrument(skip_all, err, fields(?statement))]
    async fn execute(
        &self,
        statement: &MemoryStatement,
        params: &[Value],
    ) -> Result<u64, BackendError> {
        let mut table = self.table.write().await;

        let affected = match statement {
            MemoryStatement::Claim => {
                let pid = param(params)?;
                match table.rows.values_mut().find(|row| row.pid.is_null()) {
                    Some(row) => {
                        row.pid = pid.clone();
                        1
                    }
                    None => 0,
                }
            }
            MemoryStatement::Remove => {
                let id = param(params)?
                    .as_i64()
                    .ok_or_else(|| BackendError::new("22018", "Invalid id"))?;
                u64::from(table.rows.remove(&id).is_some())
            }
            MemoryStatement::UnassignAll => {
                let mut affected = 0;
                for row in table.rows.values_mut().filter(|row| !row.pid.is_null()) {
                    row.pid = Value::Null;
                    affected += 1;
                }
                affected
            }
            MemoryStatement::UnassignProcess => {
                let pid = param(params)?;
                let mut affected = 0;
                for row in table.rows.values_mut().filter(|row| &row.pid == pid) {
                    row.pid = Value::Null;
                    affected += 1;
                }
                affected
            }
            MemoryStatement::Load => {
                return Err(BackendError::new("HY000", "load is a query, not a mutation"))
            }
        };

        Ok(affected)
    }

    #[instrument(skip_all, err, fields(?statement))]
    async fn fetch_one(
        &self,
        statement: &MemoryStatement,
        params: &[Value],
    ) -> Result<Option<Row>, BackendError> {
        if *statement != MemoryStatement::Load {
            return Err(BackendError::new("HY000", "statement returns no rows"));
        }

        let pid = param(params)?;
        let table = self.table.read().await;

        table
            .rows
            .iter()
            .rev()
            .find(|(_, row)| &row.pid == pid)
            .map(|(id, row)| self.project(*id, row))
            .transpose()
    }
}
