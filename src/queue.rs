use tracing::{debug, instrument};

use crate::{
    backend::Backend,
    config::{QueueConfig, ID_ALIAS},
    error::{QueueError, Result},
    job::Job,
    types::{JobId, ProcessId, Row, Value},
};

struct Prepared<S> {
    claim: S,
    load: S,
    remove: S,
    unassign_all: S,
    unassign_process: S,
}

/// Job queue over a shared table, safe to poll from many processes at once.
///
/// Claims are a single conditional `UPDATE` that hands the oldest unowned row
/// to the caller's pid, so mutual exclusion comes from the backend's row locks.
/// The claimed row is then re-selected by pid. Each statement commits on its
/// own; nothing is held open between the two.
pub struct JobStore<B: Backend> {
    backend: B,
    config: QueueConfig,
    statements: Prepared<B::Statement>,
}

impl<B: Backend> JobStore<B> {
    /// Validates `config` and prepares all statements the store will run.
    #[instrument(skip_all, err, fields(table = %config.table))]
    pub async fn new(backend: B, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let sql = config.statements();
        let prepare = |operation: &'static str, sql: String| {
            let backend = &backend;
            async move {
                backend
                    .prepare(&sql)
                    .await
                    .map_err(|err| QueueError::backend(operation, err))
            }
        };

        let statements = Prepared {
            claim: prepare("prepare claim", sql.claim).await?,
            load: prepare("prepare load", sql.load).await?,
            remove: prepare("prepare remove", sql.remove).await?,
            unassign_all: prepare("prepare unassign_all", sql.unassign_all).await?,
            unassign_process: prepare("prepare unassign_process", sql.unassign_process).await?,
        };

        Ok(Self {
            backend,
            config,
            statements,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Claims the oldest unowned job for `pid`. `None` means nothing was
    /// waiting.
    #[instrument(skip_all, err, fields(%pid, job_id))]
    pub async fn poll(&self, pid: ProcessId) -> Result<Option<Job>> {
        let params = [Value::from(pid)];
        let retry = &self.config.retry;

        let claimed = retry
            .run("claim", || {
                self.backend.execute(&self.statements.claim, &params)
            })
            .await?;

        if claimed == 0 {
            debug!("queue is empty");
            return Ok(None);
        }

        let row = retry
            .run("load", || {
                self.backend.fetch_one(&self.statements.load, &params)
            })
            .await?
            .ok_or(QueueError::ClaimedJobMissing { pid })?;

        let job = job_from_row(row, pid)?;
        tracing::Span::current().record("job_id", job.id().0);

        Ok(Some(job))
    }

    /// Deletes the job's row. Returns `false` when it was already gone.
    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    pub async fn remove(&self, job: &Job) -> Result<bool> {
        let params = [Value::from(job.id())];

        let removed = self
            .config
            .retry
            .run("remove", || {
                self.backend.execute(&self.statements.remove, &params)
            })
            .await?;

        Ok(removed > 0)
    }

    /// Releases every claimed job. Only safe on a cold start, when no worker
    /// of a previous scheduler can still be running.
    #[instrument(skip_all, err, ret)]
    pub async fn unassign_all(&self) -> Result<u64> {
        self.config
            .retry
            .run("unassign_all", || {
                self.backend.execute(&self.statements.unassign_all, &[])
            })
            .await
    }

    /// Releases the jobs held by a worker that has died.
    #[instrument(skip_all, err, ret, fields(%pid))]
    pub async fn unassign_process(&self, pid: ProcessId) -> Result<u64> {
        let params = [Value::from(pid)];

        self.config
            .retry
            .run("unassign_process", || {
                self.backend
                    .execute(&self.statements.unassign_process, &params)
            })
            .await
    }
}

fn job_from_row(mut row: Row, pid: ProcessId) -> Result<Job> {
    let id = match row.take_last(ID_ALIAS) {
        Some(value) => value.as_i64().ok_or_else(|| QueueError::InvalidJobId {
            value: format!("{value:?}"),
        })?,
        None => {
            return Err(QueueError::InvalidJobId {
                value: format!("no `{ID_ALIAS}` column"),
            })
        }
    };

    Ok(Job::new(JobId(id), pid, row))
}
