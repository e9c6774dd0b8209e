use bincode::Decode;

use crate::{
    error::{QueueError, Result},
    types::{JobId, ProcessId, Row, Value},
};

/// A job claimed by `poll`. Hand it back to `JobStore::remove` once done.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: JobId,
    pid: ProcessId,
    payload: Row,
}

impl Job {
    pub fn new(id: JobId, pid: ProcessId, payload: Row) -> Self {
        Self { id, pid, payload }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Payload columns keyed by their configured alias.
    pub fn payload(&self) -> &Row {
        &self.payload
    }

    pub fn value(&self, alias: &str) -> Option<&Value> {
        self.payload.get(alias)
    }

    /// Decodes a binary payload column written with bincode's standard config.
    pub fn decode<T: Decode<()>>(&self, alias: &str) -> Result<T> {
        let bytes = self
            .value(alias)
            .and_then(Value::as_bytes)
            .ok_or_else(|| QueueError::MissingColumn(alias.to_string()))?;
        let (decoded, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(decoded)
    }
}
