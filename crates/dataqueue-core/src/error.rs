//! Error taxonomy for the job-execution engine.

use thiserror::Error;

/// Errors returned by a [`crate::backend::Backend`] implementation or the
/// [`crate::queue::JobQueue`] facade that wraps it.
#[derive(Error, Debug)]
pub enum DataQueueError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {0} is not in a state that allows this operation")]
    InvalidState(i64),

    #[error("cron schedule {0:?} not found")]
    ScheduleNotFound(String),

    #[error("cron schedule name {0:?} already in use")]
    DuplicateScheduleName(String),

    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCronExpression(String, String),

    #[error("waitpoint {0:?} not found")]
    TokenNotFound(String),

    #[error("group concurrency must be greater than zero")]
    InvalidGroupConcurrency,

    #[error("unknown jobType filter {0:?}")]
    UnknownJobTypeFilter(String),

    #[error("addJob with a caller-supplied connection is not supported by the key-value backend")]
    TransactionalEnqueueUnsupported,

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DataQueueResult<T> = Result<T, DataQueueError>;
