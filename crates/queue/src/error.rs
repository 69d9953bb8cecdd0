use forgejobs_core::JobId;
use thiserror::Error;

/// Queue operation error.
///
/// Handler failures are not errors at this level: they are recorded on the job
/// record. What surfaces here is storage trouble or a reference to a job that
/// does not exist.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The backing store is unavailable or rejected the operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored row could not be decoded into a job record.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl QueueError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}
