//! Atomic transition protocol.
//!
//! Each function here is one transition. It runs inside a store transaction,
//! checks every precondition before its first write, and then performs all
//! set moves, record updates, lock changes and event appends together.
//!
//! Attempt accounting: a claim counts an attempt. Suspensions that are not
//! failures (rate-limit release, move to delayed, move to waiting-children)
//! give the attempt back.

use crate::backoff;
use crate::clock;
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::flow::{self, Resolution};
use crate::job::{Job, JobData, JobId, JobOptions, JobState, KeepJobs, ParentFailurePolicy};
use crate::keys;
use crate::limiter::{self, RateLimiterOptions};
use crate::queue::QueueConfig;
use crate::repeat;
use crate::store::{DedupEntry, Keyspace, QueueKeyspace};
use tracing::debug;

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The job now held by the caller.
    Job(Box<Job>),
    /// The queue's window is exhausted for `ttl_ms`.
    RateLimited {
        /// Remaining window (ms)
        ttl_ms: i64,
    },
    /// Nothing can be claimed right now.
    NoJobsAvailable {
        /// Due time of the earliest delayed job
        next_due: Option<i64>,
    },
}

/// Who is claiming and how.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimRequest<'a> {
    pub token: &'a str,
    pub worker: &'a str,
    pub lock_duration_ms: i64,
    pub limiter: Option<&'a RateLimiterOptions>,
}

/// Insert a prepared job record.
///
/// Returns the stored job and whether it was created. An existing id or a
/// live deduplication id returns the existing job without creating one.
pub(crate) fn insert_job(
    ks: &mut Keyspace,
    now: i64,
    job: Job,
    has_children: bool,
    max_size: usize,
) -> QueueResult<(Job, bool)> {
    keys::validate_job_id(&job.id)?;
    let queue = job.queue.clone();

    if let Some(existing) = ks.job(&queue, &job.id).cloned() {
        if let Some(parent) = &job.parent {
            flow::relink_duplicate(ks, parent, &existing);
        }
        ks.queue_mut(&queue).emit(
            now,
            QueueEvent::Duplicated {
                job_id: existing.id.clone(),
            },
        );
        return Ok((existing, false));
    }

    if let Some(dedup) = &job.opts.deduplication {
        let q = ks.queue_mut(&queue);
        let live = q
            .dedup
            .get(&dedup.id)
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .and_then(|e| q.jobs.get(&e.job_id))
            .cloned();
        if let Some(existing) = live {
            q.emit(
                now,
                QueueEvent::Deduplicated {
                    job_id: existing.id.clone(),
                    deduplication_id: dedup.id.clone(),
                },
            );
            return Ok((existing, false));
        }
    }

    if max_size > 0 {
        let pending = ks.queue(&queue).map(pending_count).unwrap_or(0);
        if pending >= max_size {
            return Err(QueueError::QueueFull);
        }
    }

    if let Some(parent) = &job.parent {
        let parent_job = ks
            .job(&parent.queue, &parent.id)
            .ok_or_else(|| QueueError::MissingParent(parent.key()))?;
        if parent_job.is_finished() {
            return Err(QueueError::not_in_state(
                parent.id.clone(),
                "unfinished",
                parent_job.state,
            ));
        }
    }

    if let Some(parent) = &job.parent {
        ks.queue_mut(&parent.queue)
            .dependencies
            .entry(parent.id.clone())
            .or_default()
            .pending
            .insert(job.key());
    }

    let q = ks.queue_mut(&queue);
    if let Some(dedup) = &job.opts.deduplication {
        q.dedup.insert(
            dedup.id.clone(),
            DedupEntry {
                job_id: job.id.clone(),
                expires_at: dedup.ttl_ms.map(|ttl| clock::after(now, ttl)),
            },
        );
    }
    let id = job.id.clone();
    let name = job.name.clone();
    let delay = job.delay_ms;
    let lifo = job.opts.lifo;
    q.jobs.insert(id.clone(), job);
    q.emit(
        now,
        QueueEvent::Added {
            job_id: id.clone(),
            name,
        },
    );

    if has_children {
        q.attach_waiting_children(&id);
        q.emit(now, QueueEvent::WaitingChildren { job_id: id.clone() });
    } else if delay > 0 {
        let due = clock::after(now, delay);
        q.attach_delayed(&id, due);
        q.emit(
            now,
            QueueEvent::Delayed {
                job_id: id.clone(),
                until: due,
            },
        );
    } else {
        q.attach_ready(&id, lifo);
        q.emit(
            now,
            QueueEvent::Waiting {
                job_id: id.clone(),
                prev: None,
            },
        );
    }
    debug!(queue = %queue, job_id = %id, "Job added");

    let job = q
        .jobs
        .get(&id)
        .cloned()
        .ok_or_else(|| QueueError::MissingKey(id.clone()))?;
    Ok((job, true))
}

/// Build and insert a job, assigning a counter id when none is given.
pub(crate) fn add_job(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    name: String,
    data: JobData,
    opts: JobOptions,
    has_children: bool,
) -> QueueResult<Job> {
    let queue = config.queue_name.as_str();
    let (id, counter) = match &opts.job_id {
        Some(id) => (id.clone(), None),
        None => {
            let (id, counter) = ks.queue_mut(queue).peek_job_id();
            (id, Some(counter))
        }
    };
    let job = Job::new(queue, id, name, data, opts, now);
    let (job, _) = insert_job(ks, now, job, has_children, config.max_size)?;
    if let Some(counter) = counter {
        let q = ks.queue_mut(queue);
        q.id_counter = q.id_counter.max(counter);
    }
    Ok(job)
}

fn pending_count(q: &QueueKeyspace) -> usize {
    q.count(JobState::Waiting)
        + q.count(JobState::Paused)
        + q.count(JobState::Prioritized)
        + q.count(JobState::Delayed)
}

/// Claim the next eligible job.
pub(crate) fn claim(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    req: ClaimRequest<'_>,
) -> QueueResult<ClaimOutcome> {
    let q = ks.queue_mut(queue);
    q.promote_due(now);

    if q.meta.paused {
        return Ok(no_jobs(q));
    }
    if q.meta.concurrency.is_some_and(|c| q.active.len() >= c) {
        return Ok(no_jobs(q));
    }

    let limiter = q.meta.limiter.clone().or_else(|| req.limiter.cloned());
    let max = limiter.as_ref().map(|l| l.max).unwrap_or(u64::MAX);
    if let Some(ttl_ms) = limiter::window_ttl(q.limiter.as_ref(), now, max) {
        return Ok(ClaimOutcome::RateLimited { ttl_ms });
    }

    loop {
        let candidate = q
            .wait
            .front()
            .cloned()
            .or_else(|| q.prioritized.first().map(|(_, id)| id.clone()));
        let Some(id) = candidate else {
            if !q.meta.drained {
                q.meta.drained = true;
                q.emit(now, QueueEvent::Drained);
            }
            return Ok(no_jobs(q));
        };

        let group = limiter
            .as_ref()
            .and_then(|l| q.jobs.get(&id).and_then(|job| l.group_of(job)));
        if let (Some(l), Some(g)) = (&limiter, &group) {
            if let Some(ttl) = limiter::window_ttl(q.group_limiters.get(g), now, l.max) {
                let since = q.jobs.get(&id).and_then(|j| j.rate_limited_since).unwrap_or(now);
                match l.group_delay(ttl, now.saturating_sub(since)) {
                    Some(delay) => {
                        let due = now.saturating_add(delay);
                        debug!(queue = %queue, job_id = %id, group = %g, due, "Group rate limited");
                        if let Some(job) = q.jobs.get_mut(&id) {
                            job.rate_limited_since = Some(since);
                        }
                        q.move_to_delayed(now, &id, due);
                        continue;
                    }
                    None => {
                        debug!(queue = %queue, job_id = %id, group = %g, "Group max delay reached");
                    }
                }
            }
        }

        let prev = q.detach(&id).unwrap_or(JobState::Waiting);
        q.attach_active(&id);
        q.acquire_lock(&id, req.token, now, req.lock_duration_ms);
        let job = match q.jobs.get_mut(&id) {
            Some(job) => {
                job.attempts_made += 1;
                job.attempts_started += 1;
                job.processed_on = Some(now);
                job.processed_by = Some(req.worker.to_string());
                job.rate_limited_since = None;
                job.clone()
            }
            None => return Err(QueueError::MissingKey(id)),
        };

        match (&limiter, group) {
            (Some(l), Some(g)) => {
                q.group_limiters.retain(|_, w| w.is_live(now));
                let mut window = q.group_limiters.get(&g).copied();
                limiter::hit(&mut window, now, l.duration_ms);
                if let Some(window) = window {
                    q.group_limiters.insert(g, window);
                }
            }
            (Some(l), None) => limiter::hit(&mut q.limiter, now, l.duration_ms),
            (None, _) => {}
        }

        q.emit(now, QueueEvent::Active { job_id: id, prev });
        return Ok(ClaimOutcome::Job(Box::new(job)));
    }
}

fn no_jobs(q: &QueueKeyspace) -> ClaimOutcome {
    ClaimOutcome::NoJobsAvailable {
        next_due: q.delayed.first().map(|(score, _)| score.primary),
    }
}

/// Require an active job locked by `token`.
fn require_owned_active(q: &QueueKeyspace, id: &str, token: &str, now: i64) -> QueueResult<()> {
    let job = q.job(id).ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    q.check_lock(id, token, now)?;
    if job.state != JobState::Active {
        return Err(QueueError::not_in_state(id, "active", job.state));
    }
    Ok(())
}

fn queue_of<'a>(ks: &'a mut Keyspace, queue: &str, id: &str) -> QueueResult<&'a mut QueueKeyspace> {
    ks.existing_queue_mut(queue)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))
}

/// Complete an active job.
pub(crate) fn complete(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    id: &str,
    token: &str,
    return_value: serde_json::Value,
) -> QueueResult<Job> {
    let queue = config.queue_name.as_str();
    let q = queue_of(ks, queue, id)?;
    require_owned_active(q, id, token, now)?;
    if q.dependencies.get(id).is_some_and(|d| !d.pending.is_empty()) {
        return Err(QueueError::PendingDependencies(id.to_string()));
    }

    q.detach(id);
    q.attach_finished(id, JobState::Completed, now);
    q.release_lock(id);
    let job = {
        let job = q
            .job_mut(id)
            .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
        job.finished_on = Some(now);
        job.return_value = Some(return_value.clone());
        job.clone()
    };
    q.emit(
        now,
        QueueEvent::Completed {
            job_id: id.to_string(),
            return_value: return_value.clone(),
        },
    );
    release_dedup(q, &job);
    debug!(queue = %queue, job_id = %id, "Job completed");

    if let Some(parent) = &job.parent {
        flow::resolve_child(ks, now, parent, &job.key(), Resolution::Processed(return_value));
    }
    repeat::produce_next(ks, now, config, &job);
    apply_retention(ks.queue_mut(queue), now, id, JobState::Completed, job.opts.remove_on_complete);
    Ok(job)
}

/// Record a handler failure: retry with backoff or fail for good.
pub(crate) fn fail(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    id: &str,
    token: &str,
    reason: &str,
    unrecoverable: bool,
) -> QueueResult<Job> {
    let queue = config.queue_name.as_str();
    let q = queue_of(ks, queue, id)?;
    require_owned_active(q, id, token, now)?;

    let delay = {
        let job = q
            .job_mut(id)
            .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
        job.failed_reason = Some(reason.to_string());
        job.push_stacktrace(reason.to_string());
        if !unrecoverable && job.can_retry() {
            let delay = backoff::retry_delay(job, reason, config.settings.backoff_strategy.as_ref());
            if let Some(delay) = delay {
                job.delay_ms = delay.max(0) as u64;
            }
            delay
        } else {
            None
        }
    };

    match delay {
        Some(delay) => {
            q.release_lock(id);
            if delay > 0 {
                q.move_to_delayed(now, id, now.saturating_add(delay));
            } else {
                q.move_to_ready(now, id, false);
            }
            debug!(queue = %queue, job_id = %id, delay, "Job will be retried");
            q.job(id)
                .cloned()
                .ok_or_else(|| QueueError::MissingKey(id.to_string()))
        }
        None => finish_failed(ks, now, config, queue, id, reason)
            .ok_or_else(|| QueueError::MissingKey(id.to_string())),
    }
}

/// Move a job to failed for good and apply everything that follows from it:
/// parent policy, next scheduler instance and retention.
pub(crate) fn finish_failed(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    queue: &str,
    id: &str,
    reason: &str,
) -> Option<Job> {
    let q = ks.existing_queue_mut(queue)?;
    let prev = q.detach(id)?;
    q.attach_finished(id, JobState::Failed, now);
    q.release_lock(id);
    let job = {
        let job = q.job_mut(id)?;
        job.finished_on = Some(now);
        job.failed_reason = Some(reason.to_string());
        job.clone()
    };
    q.emit(
        now,
        QueueEvent::Failed {
            job_id: id.to_string(),
            failed_reason: reason.to_string(),
            prev,
        },
    );
    if job.attempts_made >= job.opts.attempts {
        q.emit(
            now,
            QueueEvent::RetriesExhausted {
                job_id: id.to_string(),
                attempts_made: job.attempts_made,
            },
        );
    }
    release_dedup(q, &job);
    debug!(queue = %queue, job_id = %id, reason = %reason, "Job failed");

    if let Some(parent) = &job.parent {
        let key = job.key();
        match job.opts.on_parent_failure {
            ParentFailurePolicy::Keep => {}
            ParentFailurePolicy::FailParent => flow::fail_parent(ks, now, config, parent, &key, reason),
            ParentFailurePolicy::IgnoreDependency => flow::resolve_child(
                ks,
                now,
                parent,
                &key,
                Resolution::Failed(reason.to_string()),
            ),
            ParentFailurePolicy::RemoveDependency => {
                flow::resolve_child(ks, now, parent, &key, Resolution::Removed)
            }
        }
    }
    repeat::produce_next(ks, now, config, &job);
    apply_retention(ks.queue_mut(queue), now, id, JobState::Failed, job.opts.remove_on_fail);
    Some(job)
}

fn release_dedup(q: &mut QueueKeyspace, job: &Job) {
    if let Some(dedup_id) = &job.deduplication_id {
        let owned = q
            .dedup
            .get(dedup_id)
            .is_some_and(|e| e.job_id == job.id && e.expires_at.is_none());
        if owned {
            q.dedup.remove(dedup_id);
        }
    }
}

/// Trim finished jobs according to `keep`. `id` is the job that just
/// finished.
fn apply_retention(q: &mut QueueKeyspace, now: i64, id: &str, state: JobState, keep: KeepJobs) {
    let set = match state {
        JobState::Completed => &q.completed,
        _ => &q.failed,
    };
    let oldest_first = |set: &crate::store::ScoredSet, excess: usize| -> Vec<JobId> {
        set.iter().take(excess).map(|(_, id)| id.clone()).collect()
    };
    let victims: Vec<JobId> = match keep {
        KeepJobs::All => Vec::new(),
        KeepJobs::None => vec![id.to_string()],
        KeepJobs::Count(n) => oldest_first(set, set.len().saturating_sub(n)),
        KeepJobs::Age { age_ms, count } => {
            let cutoff = now.saturating_sub(i64::try_from(age_ms).unwrap_or(i64::MAX));
            let mut victims: Vec<JobId> = set
                .iter()
                .take_while(|(score, _)| score.primary < cutoff)
                .map(|(_, id)| id.clone())
                .collect();
            if let Some(count) = count {
                let remaining = set.len() - victims.len();
                let excess = remaining.saturating_sub(count);
                victims.extend(
                    set.iter()
                        .skip(victims.len())
                        .take(excess)
                        .map(|(_, id)| id.clone()),
                );
            }
            victims
        }
    };
    for victim in victims {
        q.delete_record(&victim);
    }
}

/// Put a throttled active job back at the head of the queue.
pub(crate) fn release_rate_limited(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    token: &str,
) -> QueueResult<()> {
    let q = queue_of(ks, queue, id)?;
    require_owned_active(q, id, token, now)?;
    q.release_lock(id);
    if let Some(job) = q.job_mut(id) {
        job.attempts_made = job.attempts_made.saturating_sub(1);
    }
    q.move_to_ready(now, id, true);
    Ok(())
}

/// Block an active job on its children.
///
/// Returns `false` without changing anything when no pending dependency
/// remains (or `child` is not pending).
pub(crate) fn move_to_waiting_children(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    token: &str,
    child: Option<&str>,
) -> QueueResult<bool> {
    let q = queue_of(ks, queue, id)?;
    require_owned_active(q, id, token, now)?;
    let blocked = match (q.dependencies.get(id), child) {
        (Some(deps), Some(child)) => deps.pending.contains(child),
        (Some(deps), None) => !deps.pending.is_empty(),
        (None, _) => false,
    };
    if !blocked {
        return Ok(false);
    }
    q.release_lock(id);
    if let Some(job) = q.job_mut(id) {
        job.attempts_made = job.attempts_made.saturating_sub(1);
    }
    q.detach(id);
    q.attach_waiting_children(id);
    q.emit(now, QueueEvent::WaitingChildren { job_id: id.to_string() });
    Ok(true)
}

/// Park an active job until `timestamp` without counting an attempt.
pub(crate) fn move_to_delayed(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    token: &str,
    timestamp: i64,
) -> QueueResult<()> {
    let q = queue_of(ks, queue, id)?;
    require_owned_active(q, id, token, now)?;
    q.release_lock(id);
    if let Some(job) = q.job_mut(id) {
        job.attempts_made = job.attempts_made.saturating_sub(1);
        job.delay_ms = timestamp.saturating_sub(now).max(0) as u64;
    }
    q.move_to_delayed(now, id, timestamp);
    Ok(())
}

fn require_state(q: &QueueKeyspace, id: &str, expected: &str, ok: impl Fn(JobState) -> bool) -> QueueResult<()> {
    let state = q
        .state_of(id)
        .ok_or_else(|| QueueError::MissingKey(id.to_string()))?;
    if !ok(state) {
        return Err(QueueError::not_in_state(id, expected, state));
    }
    Ok(())
}

/// Make a delayed job ready now.
pub(crate) fn promote(ks: &mut Keyspace, now: i64, queue: &str, id: &str) -> QueueResult<()> {
    let q = queue_of(ks, queue, id)?;
    require_state(q, id, "delayed", |s| s == JobState::Delayed)?;
    if let Some(job) = q.job_mut(id) {
        job.delay_ms = 0;
    }
    q.move_to_ready(now, id, false);
    Ok(())
}

/// Re-schedule a delayed job `delay_ms` from now.
pub(crate) fn change_delay(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    delay_ms: u64,
) -> QueueResult<()> {
    let q = queue_of(ks, queue, id)?;
    require_state(q, id, "delayed", |s| s == JobState::Delayed)?;
    if let Some(job) = q.job_mut(id) {
        job.delay_ms = delay_ms;
    }
    q.move_to_delayed(now, id, clock::after(now, delay_ms));
    Ok(())
}

/// Change the priority of a ready job and re-place it.
pub(crate) fn change_priority(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    priority: u32,
    lifo: bool,
) -> QueueResult<()> {
    let q = queue_of(ks, queue, id)?;
    require_state(q, id, "waiting, paused or prioritized", |s| s.is_ready())?;
    if let Some(job) = q.job_mut(id) {
        job.priority = priority;
        job.opts.priority = priority;
    }
    q.detach(id);
    q.attach_ready(id, lifo);
    q.emit(
        now,
        QueueEvent::Priority {
            job_id: id.to_string(),
            priority,
        },
    );
    Ok(())
}

/// Delete a job, and its descendants when `remove_children` is set.
///
/// Returns `false` when the job does not exist.
pub(crate) fn remove(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    remove_children: bool,
) -> QueueResult<bool> {
    if ks.job(queue, id).is_none() {
        return Ok(false);
    }
    let mut targets = vec![(queue.to_string(), id.to_string())];
    if remove_children {
        flow::collect_descendants(ks, queue, id, &mut targets);
    }
    for (tq, tid) in &targets {
        if ks.queue(tq).is_some_and(|q| q.lock_is_live(tid, now)) {
            return Err(QueueError::JobLocked(keys::job_key(tq, tid)));
        }
    }

    let orphans: Vec<String> = if remove_children {
        Vec::new()
    } else {
        ks.queue(queue)
            .and_then(|q| q.dependencies.get(id))
            .map(|d| d.child_keys().cloned().collect())
            .unwrap_or_default()
    };
    let removed: Vec<String> = targets.iter().map(|(q, id)| keys::job_key(q, id)).collect();

    for (tq, tid) in targets.iter().rev() {
        let q = ks.queue_mut(tq);
        let Some(job) = q.delete_record(tid) else {
            continue;
        };
        q.emit(
            now,
            QueueEvent::Removed {
                job_id: tid.clone(),
                prev: job.state,
            },
        );
        if let Some(parent) = &job.parent {
            if !removed.contains(&parent.key()) {
                flow::resolve_child(ks, now, parent, &job.key(), Resolution::Removed);
            }
        }
    }

    for key in orphans {
        if let Some((cq, cid)) = keys::parse_job_key(&key) {
            if let Some(child) = ks.existing_queue_mut(cq).and_then(|q| q.job_mut(cid)) {
                child.parent = None;
                child.opts.parent = None;
            }
        }
    }
    debug!(queue = %queue, job_id = %id, count = removed.len(), "Job removed");
    Ok(true)
}

/// Extend a lock held by `token`.
pub(crate) fn extend_lock(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    id: &str,
    token: &str,
    duration_ms: i64,
) -> bool {
    ks.existing_queue_mut(queue)
        .is_some_and(|q| q.extend_lock(id, token, now, duration_ms))
}
