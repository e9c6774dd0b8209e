//! Table layout of a queue and the statements rendered from it.
//!
//! Table and column names are inserted into SQL verbatim. Quote them yourself
//! (`` `order` ``, `"order"`) if they need escaping for your engine.

use std::{collections::HashSet, time::Duration};

use serde::Deserialize;

use crate::error::{QueueError, Result};

/// Alias the load statement gives the id column so it can be told apart from
/// payload columns.
pub const ID_ALIAS: &str = "__id";

const DEFAULT_ID_COLUMN: &str = "id";
const DEFAULT_PID_COLUMN: &str = "pid";

/// A payload column read from `source` and exposed under `alias`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ColumnSpec")]
pub struct Column {
    pub alias: String,
    pub source: String,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            source: name,
        }
    }

    pub fn aliased(alias: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            source: source.into(),
        }
    }

    fn render(&self) -> String {
        if self.alias == self.source {
            self.source.clone()
        } else {
            format!("{} AS {}", self.source, self.alias)
        }
    }
}

/// Either `"name"` or `{ alias = "...", source = "..." }` in config files.
#[derive(Deserialize)]
#[serde(untagged)]
enum ColumnSpec {
    Bare(String),
    Aliased { alias: String, source: String },
}

impl From<ColumnSpec> for Column {
    fn from(column: ColumnSpec) -> Self {
        match column {
            ColumnSpec::Bare(name) => Column::new(name),
            ColumnSpec::Aliased { alias, source } => Column::aliased(alias, source),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// `*`: every column of the table, including id and pid.
    #[default]
    All,
    Columns(Vec<Column>),
}

impl Projection {
    fn render(&self) -> String {
        match self {
            Projection::All => "*".to_string(),
            Projection::Columns(columns) => columns
                .iter()
                .map(Column::render)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// How often and how long to back off when the backend reports a deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total executions allowed, the first one included. Zero is treated as
    /// one.
    pub attempts: u32,
    #[serde(deserialize_with = "millis::deserialize")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(5),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_pid_column")]
    pub pid_column: String,
    #[serde(default)]
    pub projection: Projection,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

fn default_pid_column() -> String {
    DEFAULT_PID_COLUMN.to_string()
}

impl QueueConfig {
    pub fn builder(table: impl Into<String>) -> QueueConfigBuilder {
        QueueConfigBuilder {
            config: QueueConfig {
                table: table.into(),
                id_column: default_id_column(),
                pid_column: default_pid_column(),
                projection: Projection::All,
                retry: RetryPolicy::default(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (what, name) in [
            ("table", &self.table),
            ("id column", &self.id_column),
            ("pid column", &self.pid_column),
        ] {
            if name.trim().is_empty() {
                return Err(QueueError::Config(format!("{what} name is empty")));
            }
        }

        if let Projection::Columns(columns) = &self.projection {
            if columns.is_empty() {
                return Err(QueueError::Config(
                    "explicit projection has no columns".to_string(),
                ));
            }

            let mut seen = HashSet::new();
            for column in columns {
                if column.alias.trim().is_empty() || column.source.trim().is_empty() {
                    return Err(QueueError::Config(format!(
                        "column `{}` AS `{}` has an empty name",
                        column.source, column.alias
                    )));
                }
                if column.alias == ID_ALIAS {
                    return Err(QueueError::Config(format!(
                        "alias `{ID_ALIAS}` is reserved"
                    )));
                }
                if !seen.insert(column.alias.as_str()) {
                    return Err(QueueError::Config(format!(
                        "duplicate column alias `{}`",
                        column.alias
                    )));
                }
            }
        }

        if self.retry.attempts == 0 {
            return Err(QueueError::Config(
                "retry policy must allow at least one attempt".to_string(),
            ));
        }

        Ok(())
    }

    pub fn statements(&self) -> Statements {
        Statements::render(self)
    }
}

pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn id_column(mut self, name: impl Into<String>) -> Self {
        self.config.id_column = name.into();
        self
    }

    pub fn pid_column(mut self, name: impl Into<String>) -> Self {
        self.config.pid_column = name.into();
        self
    }

    /// Adds a payload column. The first call switches the projection from
    /// `*` to an explicit column list.
    pub fn column(self, name: impl Into<String>) -> Self {
        self.push(Column::new(name))
    }

    pub fn aliased(self, alias: impl Into<String>, source: impl Into<String>) -> Self {
        self.push(Column::aliased(alias, source))
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    fn push(mut self, column: Column) -> Self {
        match &mut self.config.projection {
            Projection::All => self.config.projection = Projection::Columns(vec![column]),
            Projection::Columns(columns) => columns.push(column),
        }
        self
    }

    pub fn build(self) -> Result<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// SQL text of the five statements a queue runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statements {
    pub claim: String,
    pub load: String,
    pub remove: String,
    pub unassign_all: String,
    pub unassign_process: String,
}

impl Statements {
    pub fn render(config: &QueueConfig) -> Self {
        let QueueConfig {
            table,
            id_column: id,
            pid_column: pid,
            projection,
            ..
        } = config;

        Self {
            claim: format!(
                "UPDATE {table} SET {pid} = :pid WHERE {pid} IS NULL ORDER BY {id} ASC LIMIT 1"
            ),
            load: format!(
                "SELECT {}, {id} AS {ID_ALIAS} FROM {table} WHERE {pid} = :pid ORDER BY {id} DESC LIMIT 1",
                projection.render()
            ),
            remove: format!("DELETE FROM {table} WHERE {id} = :id"),
            unassign_all: format!("UPDATE {table} SET {pid} = NULL"),
            unassign_process: format!("UPDATE {table} SET {pid} = NULL WHERE {pid} = :pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_statements() {
        let config = QueueConfig::builder("jobs").build().unwrap();
        let statements = config.statements();

        assert_eq!(
            statements.claim,
            "UPDATE jobs SET pid = :pid WHERE pid IS NULL ORDER BY id ASC LIMIT 1"
        );
        assert_eq!(
            statements.load,
            "SELECT *, id AS __id FROM jobs WHERE pid = :pid ORDER BY id DESC LIMIT 1"
        );
        assert_eq!(statements.remove, "DELETE FROM jobs WHERE id = :id");
        assert_eq!(statements.unassign_all, "UPDATE jobs SET pid = NULL");
        assert_eq!(
            statements.unassign_process,
            "UPDATE jobs SET pid = NULL WHERE pid = :pid"
        );
    }

    #[test]
    fn renders_projection_with_aliases() {
        let config = QueueConfig::builder("`queue`")
            .id_column("job_id")
            .pid_column("owner")
            .column("kind")
            .aliased("body", "payload")
            .build()
            .unwrap();

        assert_eq!(
            config.statements().load,
            "SELECT kind, payload AS body, job_id AS __id FROM `queue` WHERE owner = :pid ORDER BY job_id DESC LIMIT 1"
        );
        assert_eq!(
            config.statements().claim,
            "UPDATE `queue` SET owner = :pid WHERE owner IS NULL ORDER BY job_id ASC LIMIT 1"
        );
    }

    #[test]
    fn rejects_bad_projections() {
        let reserved = QueueConfig::builder("jobs").aliased(ID_ALIAS, "x").build();
        assert!(matches!(reserved, Err(QueueError::Config(_))));

        let duplicate = QueueConfig::builder("jobs")
            .column("a")
            .aliased("a", "b")
            .build();
        assert!(matches!(duplicate, Err(QueueError::Config(_))));

        let empty_table = QueueConfig::builder(" ").build();
        assert!(matches!(empty_table, Err(QueueError::Config(_))));

        let no_attempts = QueueConfig::builder("jobs")
            .retry(RetryPolicy {
                attempts: 0,
                backoff: Duration::ZERO,
            })
            .build();
        assert!(matches!(no_attempts, Err(QueueError::Config(_))));

        let mut config = QueueConfig::builder("jobs").build().unwrap();
        config.projection = Projection::Columns(Vec::new());
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn deserializes_from_config_file() {
        let config: QueueConfig = serde_json::from_str(
            r#"{
                "table": "jobs",
                "pid_column": "worker",
                "projection": { "columns": ["kind", { "alias": "body", "source": "payload" }] },
                "retry": { "attempts": 3, "backoff": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.id_column, "id");
        assert_eq!(config.pid_column, "worker");
        assert_eq!(
            config.projection,
            Projection::Columns(vec![
                Column::new("kind"),
                Column::aliased("body", "payload")
            ])
        );
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.backoff, Duration::from_millis(10));
        config.validate().unwrap();
    }
}
