//! Error types for cron operations.

use thiserror::Error;

/// Result type for cron operations.
pub type CronResult<T> = Result<T, CronError>;

/// Cron-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// The expression could not be parsed.
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),

    /// The expression has a field count the parser does not understand.
    #[error("Cron expression must have 5, 6 or 7 fields, got {0}")]
    FieldCount(usize),
}
