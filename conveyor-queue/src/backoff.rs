//! Retry delays.

use crate::job::{Backoff, Job};
use std::sync::Arc;

/// Custom backoff: `(attempts_made, strategy name, failure reason, job)` to a
/// delay in milliseconds, or `None` to stop retrying.
pub type BackoffStrategy = Arc<dyn Fn(u32, &str, &str, &Job) -> Option<i64> + Send + Sync>;

/// Delay before the next attempt of `job`, or `None` when the failure must
/// be terminal.
pub(crate) fn retry_delay(job: &Job, reason: &str, strategy: Option<&BackoffStrategy>) -> Option<i64> {
    let attempts = job.attempts_made.max(1);
    match &job.opts.backoff {
        None => Some(0),
        Some(Backoff::Fixed { delay_ms, jitter }) => Some(apply_jitter(*delay_ms as f64, *jitter)),
        Some(Backoff::Exponential { delay_ms, jitter }) => {
            let factor = 2f64.powi(attempts.saturating_sub(1).min(62) as i32);
            Some(apply_jitter(*delay_ms as f64 * factor, *jitter))
        }
        Some(Backoff::Custom { name }) => {
            let strategy = strategy?;
            strategy(attempts, name, reason, job).map(|d| d.max(0))
        }
    }
}

/// Reduce `delay` by a random share of up to `jitter`.
fn apply_jitter(delay: f64, jitter: f64) -> i64 {
    let delay = if jitter > 0.0 {
        let min = delay * (1.0 - jitter);
        min + rand::random::<f64>() * delay * jitter
    } else {
        delay
    };
    delay.min(i64::MAX as f64).floor() as i64
}
