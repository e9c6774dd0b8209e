use thiserror::Error;

use crate::{backend::BackendError, types::ProcessId};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{operation} failed: SQLSTATE[{sqlstate}] ({}): {message}", display_code(.vendor_code))]
    Backend {
        operation: &'static str,
        sqlstate: String,
        vendor_code: Option<i64>,
        message: String,
    },

    #[error("{operation} failed: deadlock retries exceeded after {attempts} attempts")]
    DeadlockRetriesExceeded {
        operation: &'static str,
        attempts: u32,
    },

    #[error("claimed a job for pid {pid} but no row owned by it could be loaded")]
    ClaimedJobMissing { pid: ProcessId },

    #[error("claimed row has no usable job id: {value}")]
    InvalidJobId { value: String },

    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error("payload column `{0}` is missing or not binary")]
    MissingColumn(String),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl QueueError {
    pub(crate) fn backend(operation: &'static str, err: BackendError) -> Self {
        QueueError::Backend {
            operation,
            sqlstate: err.sqlstate,
            vendor_code: err.vendor_code,
            message: err.message,
        }
    }

    /// True for failures that mean the table no longer matches what this store
    /// wrote to it.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            QueueError::ClaimedJobMissing { .. } | QueueError::InvalidJobId { .. }
        )
    }
}

fn display_code(code: &Option<i64>) -> String {
    code.map_or_else(|| "-".to_string(), |c| c.to_string())
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
