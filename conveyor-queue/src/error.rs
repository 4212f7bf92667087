//! Error types for queue operations.

use crate::job::JobState;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
///
/// Precondition violations are always reported to the caller of the
/// operation that triggered them; the keyspace is left untouched.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job record does not exist (never added, or already removed).
    #[error("Missing key for job {0}")]
    MissingKey(String),

    /// The job has no live lock.
    #[error("Missing lock for job {0}")]
    MissingLock(String),

    /// The job is locked by another token.
    #[error("Lock mismatch for job {0}")]
    LockMismatch(String),

    /// The job is not in the state the operation requires.
    #[error("Job {job_id} is not in the {expected} state (current: {actual})")]
    NotInState {
        /// Job identifier
        job_id: String,
        /// Required state(s)
        expected: String,
        /// Actual state
        actual: JobState,
    },

    /// The job is held by a worker and cannot be touched.
    #[error("Job {0} is locked by a worker")]
    JobLocked(String),

    /// The job still has unfinished children.
    #[error("Job {0} has pending dependencies")]
    PendingDependencies(String),

    /// The referenced parent job does not exist.
    #[error("Missing key for parent job {0}")]
    MissingParent(String),

    /// The job id is not usable.
    #[error("Invalid job id {0:?}: ids must be non-empty and must not contain ':'")]
    InvalidJobId(String),

    /// Queue is full
    #[error("Queue is full")]
    QueueFull,

    /// Invalid repeat options
    #[error("Invalid repeat options: {0}")]
    InvalidRepeat(String),

    /// Cron parse error
    #[error(transparent)]
    Cron(#[from] conveyor_cron::CronError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// IO error while persisting or loading a snapshot
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,
}

impl QueueError {
    pub(crate) fn not_in_state(
        job_id: impl Into<String>,
        expected: impl Into<String>,
        actual: JobState,
    ) -> Self {
        Self::NotInState {
            job_id: job_id.into(),
            expected: expected.into(),
            actual,
        }
    }
}

/// Outcome of a job handler that did not produce a result.
///
/// `RateLimited`, `Delayed` and `WaitingChildren` are signals rather than
/// failures: they never consume a retry attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// A failure that is retried according to the job's attempts and backoff.
    #[error("{0}")]
    Failed(String),

    /// A failure that moves the job to failed regardless of attempts left.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// The handler throttled the queue; the job goes back to wait.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The handler already moved the job to delayed.
    #[error("Job moved to delayed")]
    Delayed,

    /// The handler already moved the job to waiting-children.
    #[error("Job moved to waiting-children")]
    WaitingChildren,
}

impl JobError {
    /// Create a recoverable failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Create an unrecoverable failure.
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable(reason.into())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}
