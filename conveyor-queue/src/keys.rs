//! Job key naming.
//!
//! A job is addressed across queues by `<queue>:<id>`. Ids never contain the
//! separator, so the last `:` always splits a key unambiguously even when the
//! queue name itself contains one.

use crate::error::{QueueError, QueueResult};

/// Namespace separator.
pub const SEPARATOR: char = ':';

/// Build a job key.
pub fn job_key(queue: &str, id: &str) -> String {
    format!("{}{}{}", queue, SEPARATOR, id)
}

/// Split a job key into `(queue, id)`.
pub fn parse_job_key(key: &str) -> Option<(&str, &str)> {
    let (queue, id) = key.rsplit_once(SEPARATOR)?;
    if queue.is_empty() || id.is_empty() {
        return None;
    }
    Some((queue, id))
}

/// Check a caller-supplied id.
pub fn validate_job_id(id: &str) -> QueueResult<()> {
    if id.is_empty() || id.contains(SEPARATOR) {
        return Err(QueueError::InvalidJobId(id.to_string()));
    }
    Ok(())
}

/// Id of the scheduler instance due at `millis`.
pub fn repeat_job_id(scheduler_key: &str, millis: i64) -> String {
    format!("repeat-{}-{}", scheduler_key, millis)
}
