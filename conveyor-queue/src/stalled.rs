//! Stalled-job recovery.
//!
//! A sweep runs in two phases. Phase (a) looks at the candidates marked by
//! the previous sweep: a candidate that is still active but whose lock is
//! missing or expired has been abandoned by its worker. It goes back to the
//! head of the queue, or fails once it has stalled more than the allowed
//! number of times. Phase (b) marks every active job as a candidate for the
//! next sweep; renewing a lock clears the mark.
//!
//! Sweeps are gated: while the gate set by one sweep is open, sweeps from
//! other workers are no-ops, so the interval is honoured queue-wide.

use crate::events::QueueEvent;
use crate::job::{JobId, JobState};
use crate::protocol;
use crate::queue::QueueConfig;
use crate::store::Keyspace;
use std::collections::BTreeSet;
use tracing::warn;

/// Reason recorded on jobs that stalled too often.
pub const STALLED_FAILURE_REASON: &str = "job stalled more than allowable limit";

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    /// Whether the sweep ran (the gate was not held)
    pub ran: bool,
    /// Jobs moved back to the queue
    pub recovered: Vec<JobId>,
    /// Jobs failed for stalling too often
    pub failed: Vec<JobId>,
}

/// Run one gated sweep.
pub(crate) fn check_stalled(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    max_stalled_count: u32,
    interval_ms: i64,
) -> StalledReport {
    let queue = config.queue_name.as_str();
    let q = ks.queue_mut(queue);
    if q.stalled_gate.is_some_and(|gate| gate > now) {
        return StalledReport::default();
    }
    q.stalled_gate = Some(now.saturating_add(interval_ms));

    let mut report = StalledReport {
        ran: true,
        ..StalledReport::default()
    };
    let candidates = std::mem::take(&mut q.stalled);
    for id in candidates {
        let q = ks.queue_mut(queue);
        if q.state_of(&id) != Some(JobState::Active) || q.lock_is_live(&id, now) {
            continue;
        }
        let counter = match q.job_mut(&id) {
            Some(job) => {
                job.stalled_counter += 1;
                job.stalled_counter
            }
            None => continue,
        };
        if counter > max_stalled_count {
            warn!(queue = %queue, job_id = %id, counter, "Job stalled too many times");
            if let Some(job) = q.job_mut(&id) {
                job.push_stacktrace(STALLED_FAILURE_REASON.to_string());
            }
            protocol::finish_failed(ks, now, config, queue, &id, STALLED_FAILURE_REASON);
            report.failed.push(id);
        } else {
            warn!(queue = %queue, job_id = %id, counter, "Job stalled, moving back to wait");
            q.release_lock(&id);
            q.emit(now, QueueEvent::Stalled { job_id: id.clone() });
            q.move_to_ready(now, &id, true);
            report.recovered.push(id);
        }
    }

    let q = ks.queue_mut(queue);
    q.stalled = q.active.iter().cloned().collect::<BTreeSet<_>>();
    report
}
