//! Job locks.
//!
//! A claimed job holds a lock made of a random token and an expiry. An
//! unexpired lock with a matching token is the only proof that a worker owns
//! the job: every lock-requiring transition checks it, and a job whose lock
//! is missing or expired is eligible for stalled recovery.

use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;
use crate::store::QueueKeyspace;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use uuid::Uuid;

/// Lock held on an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Owner token
    pub token: String,
    /// Expiry (ms)
    pub expires_at: i64,
}

/// Generate a fresh lock token.
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

impl QueueKeyspace {
    pub(crate) fn acquire_lock(&mut self, id: &str, token: &str, now: i64, duration_ms: i64) {
        self.locks.insert(
            id.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now.saturating_add(duration_ms),
            },
        );
    }

    /// Whether `id` holds an unexpired lock.
    pub fn lock_is_live(&self, id: &str, now: i64) -> bool {
        self.locks.get(id).is_some_and(|l| l.expires_at > now)
    }

    /// Require a live lock owned by `token`.
    pub(crate) fn check_lock(&self, id: &str, token: &str, now: i64) -> QueueResult<()> {
        match self.locks.get(id) {
            Some(lock) if lock.expires_at <= now => Err(QueueError::MissingLock(id.to_string())),
            Some(lock) if lock.token != token => Err(QueueError::LockMismatch(id.to_string())),
            Some(_) => Ok(()),
            None => Err(QueueError::MissingLock(id.to_string())),
        }
    }

    pub(crate) fn extend_lock(&mut self, id: &str, token: &str, now: i64, duration_ms: i64) -> bool {
        match self.locks.get_mut(id) {
            Some(lock) if lock.token == token && lock.expires_at > now => {
                lock.expires_at = now.saturating_add(duration_ms);
                self.stalled.remove(id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn release_lock(&mut self, id: &str) {
        self.locks.remove(id);
        self.stalled.remove(id);
    }
}

/// Keep a job's lock alive until `done` is cancelled.
///
/// When a renewal is refused the job is no longer ours: `job_token` is
/// cancelled so the handler can stop, and the task ends.
pub(crate) fn spawn_lock_renewal(
    queue: Queue,
    job_id: String,
    token: String,
    lock_duration: Duration,
    renew_every: Duration,
    job_token: CancellationToken,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = tokio::time::sleep(renew_every) => {
                    if queue.extend_lock(&job_id, &token, lock_duration).await {
                        trace!(queue = %queue.name(), job_id = %job_id, "Lock renewed");
                    } else {
                        warn!(queue = %queue.name(), job_id = %job_id, "Lock lost, cancelling job");
                        job_token.cancel();
                        break;
                    }
                }
            }
        }
    })
}
