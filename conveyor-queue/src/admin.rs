//! Administrative transitions: pause, drain, clean, retry and friends.

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::flow::{self, Resolution};
use crate::job::{JobData, JobId, JobState};
use crate::limiter::{self, RateLimiterOptions};
use crate::store::{Keyspace, QueueKeyspace};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

/// Pause the queue: ready jobs without a priority move to the paused list.
pub(crate) fn pause(ks: &mut Keyspace, now: i64, queue: &str) {
    let q = ks.queue_mut(queue);
    if !q.meta.paused {
        q.meta.paused = true;
        let waiting = std::mem::take(&mut q.wait);
        for id in &waiting {
            if let Some(job) = q.job_mut(id) {
                job.state = JobState::Paused;
            }
        }
        q.paused.extend(waiting);
    }
    q.emit(now, QueueEvent::Paused);
    info!(queue = %queue, "Queue paused");
}

/// Resume the queue.
pub(crate) fn resume(ks: &mut Keyspace, now: i64, queue: &str) {
    let q = ks.queue_mut(queue);
    if q.meta.paused {
        q.meta.paused = false;
        let paused = std::mem::take(&mut q.paused);
        for id in &paused {
            if let Some(job) = q.job_mut(id) {
                job.state = JobState::Waiting;
            }
        }
        q.wait.extend(paused);
        q.meta.drained = false;
    }
    q.emit(now, QueueEvent::Resumed);
    info!(queue = %queue, "Queue resumed");
}

/// Delete jobs and resolve them on their parents as removed.
fn delete_jobs(ks: &mut Keyspace, now: i64, queue: &str, ids: &[JobId]) {
    for id in ids {
        let Some(job) = ks.queue_mut(queue).delete_record(id) else {
            continue;
        };
        if let Some(parent) = &job.parent {
            flow::resolve_child(ks, now, parent, &job.key(), Resolution::Removed);
        }
    }
}

/// Delete every ready job, and delayed jobs too when `delayed` is set.
pub(crate) fn drain(ks: &mut Keyspace, now: i64, queue: &str, delayed: bool) -> usize {
    let Some(q) = ks.queue(queue) else {
        return 0;
    };
    let mut ids = q.ids(JobState::Waiting);
    ids.extend(q.ids(JobState::Paused));
    ids.extend(q.ids(JobState::Prioritized));
    if delayed {
        ids.extend(q.ids(JobState::Delayed));
    }
    delete_jobs(ks, now, queue, &ids);
    debug!(queue = %queue, count = ids.len(), "Queue drained");
    ids.len()
}

/// Delete up to `limit` jobs (0 = no limit) in `state` older than `grace`.
///
/// Finished jobs are aged by finish time, others by creation time. Active
/// jobs with a live lock are never cleaned.
pub(crate) fn clean(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    grace: Duration,
    limit: usize,
    state: JobState,
) -> Vec<JobId> {
    let Some(q) = ks.queue(queue) else {
        return Vec::new();
    };
    let cutoff = now.saturating_sub(crate::clock::millis(grace));
    let limit = if limit == 0 { usize::MAX } else { limit };
    let ids: Vec<JobId> = q
        .ids(state)
        .into_iter()
        .filter(|id| {
            q.job(id).is_some_and(|job| {
                let age_from = if state.is_finished() {
                    job.finished_on.unwrap_or(job.timestamp)
                } else {
                    job.timestamp
                };
                age_from <= cutoff && !q.lock_is_live(id, now)
            })
        })
        .take(limit)
        .collect();
    delete_jobs(ks, now, queue, &ids);
    ks.queue_mut(queue)
        .emit(now, QueueEvent::Cleaned { count: ids.len() });
    debug!(queue = %queue, state = %state, count = ids.len(), "Jobs cleaned");
    ids
}

/// Reset a finished job and make it ready again.
fn reprocess(q: &mut QueueKeyspace, now: i64, id: &str) {
    if let Some(job) = q.job_mut(id) {
        job.attempts_made = 0;
        job.stalled_counter = 0;
        job.processed_on = None;
        job.finished_on = None;
        job.return_value = None;
        job.failed_reason = None;
    }
    let lifo = q.job(id).is_some_and(|j| j.opts.lifo);
    q.move_to_ready(now, id, lifo);
}

/// Retry one finished job.
pub(crate) fn retry_job(ks: &mut Keyspace, now: i64, queue: &str, id: &str) -> QueueResult<()> {
    let q = ks
        .existing_queue_mut(queue)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    let state = q
        .state_of(id)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    if !state.is_finished() {
        return Err(QueueError::not_in_state(id, "failed or completed", state));
    }
    reprocess(q, now, id);
    Ok(())
}

/// Retry every finished job in `state` that finished at or before
/// `timestamp` (default: now).
pub(crate) fn retry_jobs(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    state: JobState,
    timestamp: Option<i64>,
) -> QueueResult<usize> {
    if !state.is_finished() {
        return Err(QueueError::Config(format!(
            "only failed or completed jobs can be retried, not {}",
            state
        )));
    }
    let Some(q) = ks.existing_queue_mut(queue) else {
        return Ok(0);
    };
    let until = timestamp.unwrap_or(now);
    let set = match state {
        JobState::Completed => &q.completed,
        _ => &q.failed,
    };
    let ids: Vec<JobId> = set
        .iter()
        .take_while(|(score, _)| score.primary <= until)
        .map(|(_, id)| id.clone())
        .collect();
    for id in &ids {
        reprocess(q, now, id);
    }
    Ok(ids.len())
}

/// Promote up to `limit` delayed jobs (0 = all) in due order.
pub(crate) fn promote_jobs(ks: &mut Keyspace, now: i64, queue: &str, limit: usize) -> usize {
    let Some(q) = ks.existing_queue_mut(queue) else {
        return 0;
    };
    let limit = if limit == 0 { usize::MAX } else { limit };
    let ids: Vec<JobId> = q.ids(JobState::Delayed).into_iter().take(limit).collect();
    for id in &ids {
        if let Some(job) = q.job_mut(id) {
            job.delay_ms = 0;
        }
        q.move_to_ready(now, id, false);
    }
    ids.len()
}

/// Replace a job's data.
pub(crate) fn update_data(ks: &mut Keyspace, queue: &str, id: &str, data: JobData) -> QueueResult<()> {
    let job = ks
        .existing_queue_mut(queue)
        .and_then(|q| q.job_mut(id))
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    job.data = data;
    Ok(())
}

/// Record progress and emit `progress`.
pub(crate) fn update_progress(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    progress: serde_json::Value,
) -> QueueResult<()> {
    let q = ks
        .existing_queue_mut(queue)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    let job = q
        .job_mut(id)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    job.progress = progress.clone();
    q.emit(
        now,
        QueueEvent::Progress {
            job_id: id.to_string(),
            data: progress,
        },
    );
    Ok(())
}

/// Append a log line, keeping the newest `keep_logs` lines. Returns the
/// number of lines kept.
pub(crate) fn add_log(ks: &mut Keyspace, queue: &str, id: &str, line: String) -> QueueResult<usize> {
    let q = ks
        .existing_queue_mut(queue)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    let keep = q
        .job(id)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?
        .opts
        .keep_logs;
    let logs: &mut VecDeque<String> = q.logs.entry(id.to_string()).or_default();
    logs.push_back(line);
    if let Some(keep) = keep {
        while logs.len() > keep {
            logs.pop_front();
        }
    }
    Ok(logs.len())
}

/// Set or clear the queue-wide concurrency cap.
pub(crate) fn set_global_concurrency(ks: &mut Keyspace, queue: &str, concurrency: Option<usize>) {
    ks.queue_mut(queue).meta.concurrency = concurrency;
}

/// Set or clear the queue-wide limiter.
pub(crate) fn set_global_rate_limit(
    ks: &mut Keyspace,
    queue: &str,
    limiter: Option<RateLimiterOptions>,
) -> QueueResult<()> {
    if let Some(limiter) = &limiter {
        limiter.validate()?;
    }
    ks.queue_mut(queue).meta.limiter = limiter;
    Ok(())
}

/// Saturate the queue's window for `expire`.
pub(crate) fn rate_limit(ks: &mut Keyspace, now: i64, queue: &str, expire: Duration) {
    ks.queue_mut(queue).limiter = Some(limiter::saturated(now, expire));
}

/// Saturate one group's window for `expire`.
pub(crate) fn rate_limit_group(ks: &mut Keyspace, now: i64, queue: &str, group: &str, expire: Duration) {
    ks.queue_mut(queue)
        .group_limiters
        .insert(group.to_string(), limiter::saturated(now, expire));
}

/// Keep at most `max_len` events.
pub(crate) fn trim_events(ks: &mut Keyspace, queue: &str, max_len: usize) {
    ks.queue_mut(queue).events.set_max_len(max_len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobOptions};
    use serde_json::json;

    fn add(ks: &mut Keyspace, id: &str, timestamp: i64) {
        let q = ks.queue_mut("q");
        q.jobs.insert(
            id.to_string(),
            Job::new("q", id, "t", json!(null), JobOptions::default(), timestamp),
        );
        q.attach_ready(id, false);
    }

    #[test]
    fn test_pause_and_resume_move_jobs() {
        let mut ks = Keyspace::default();
        add(&mut ks, "1", 0);
        add(&mut ks, "2", 0);
        pause(&mut ks, 0, "q");

        let q = ks.queue("q").unwrap();
        assert_eq!(q.ids(JobState::Paused), vec!["1".to_string(), "2".to_string()]);
        assert!(q.check_consistency().is_ok());

        resume(&mut ks, 0, "q");
        let q = ks.queue("q").unwrap();
        assert_eq!(q.ids(JobState::Waiting), vec!["1".to_string(), "2".to_string()]);
        assert!(q.check_consistency().is_ok());
    }

    #[test]
    fn test_clean_respects_grace_and_limit() {
        let mut ks = Keyspace::default();
        add(&mut ks, "old1", 0);
        add(&mut ks, "old2", 0);
        add(&mut ks, "new", 9_000);

        let cleaned = clean(&mut ks, 10_000, "q", Duration::from_secs(5), 1, JobState::Waiting);
        assert_eq!(cleaned, vec!["old1".to_string()]);
        let cleaned = clean(&mut ks, 10_000, "q", Duration::from_secs(5), 0, JobState::Waiting);
        assert_eq!(cleaned, vec!["old2".to_string()]);
        assert_eq!(ks.queue("q").unwrap().ids(JobState::Waiting), vec!["new".to_string()]);
    }

    #[test]
    fn test_retry_jobs_only_finished() {
        let mut ks = Keyspace::default();
        add(&mut ks, "1", 0);
        let q = ks.queue_mut("q");
        q.detach("1");
        q.attach_finished("1", JobState::Failed, 50);
        q.job_mut("1").unwrap().attempts_made = 3;

        assert!(retry_jobs(&mut ks, 100, "q", JobState::Waiting, None).is_err());
        assert_eq!(retry_jobs(&mut ks, 100, "q", JobState::Failed, Some(10)).unwrap(), 0);
        assert_eq!(retry_jobs(&mut ks, 100, "q", JobState::Failed, None).unwrap(), 1);
        let job = ks.job("q", "1").unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(matches!(
            retry_job(&mut ks, 100, "q", "1"),
            Err(QueueError::NotInState { .. })
        ));
    }

    #[test]
    fn test_logs_are_bounded() {
        let mut ks = Keyspace::default();
        let q = ks.queue_mut("q");
        q.jobs.insert(
            "1".into(),
            Job::new("q", "1", "t", json!(null), JobOptions::new().with_keep_logs(2), 0),
        );
        q.attach_ready("1", false);

        for line in ["a", "b", "c"] {
            add_log(&mut ks, "q", "1", line.to_string()).unwrap();
        }
        let logs: Vec<_> = ks.queue("q").unwrap().logs["1"].iter().cloned().collect();
        assert_eq!(logs, vec!["b", "c"]);
        assert!(matches!(
            add_log(&mut ks, "q", "2", "x".into()),
            Err(QueueError::MissingKey(_))
        ));
    }

    #[test]
    fn test_drain_keeps_delayed_unless_asked() {
        let mut ks = Keyspace::default();
        add(&mut ks, "1", 0);
        add(&mut ks, "2", 0);
        let q = ks.queue_mut("q");
        q.detach("2");
        q.attach_delayed("2", 1_000);

        assert_eq!(drain(&mut ks, 0, "q", false), 1);
        assert_eq!(ks.queue("q").unwrap().count(JobState::Delayed), 1);
        assert_eq!(drain(&mut ks, 0, "q", true), 1);
        assert!(ks.queue("q").unwrap().jobs.is_empty());
    }
}
