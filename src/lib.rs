//! A job queue kept in one relational table that many worker processes poll
//! at once, with no coordination service besides the database itself.
//!
//! Workers call [`JobStore::poll`] with their pid and [`JobStore::remove`]
//! when a job is done. A scheduler calls [`JobStore::unassign_all`] when it
//! starts and [`JobStore::unassign_process`] when it finds a dead worker.

pub mod backend;
pub mod config;
pub mod error;
mod executor;
pub mod job;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod queue;
pub mod types;

pub use backend::{Backend, BackendError};
pub use config::{Column, Projection, QueueConfig, RetryPolicy, Statements};
pub use error::{QueueError, Result};
pub use job::Job;
pub use memory::MemoryBackend;
pub use queue::JobStore;
pub use types::{JobId, ProcessId, Row, Value};

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::{
        Backend, BackendError, Job, JobId, JobStore, MemoryBackend, ProcessId, QueueConfig,
        QueueError, RetryPolicy, Row, Value,
    };
}
