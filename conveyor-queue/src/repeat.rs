//! Job schedulers.
//!
//! A scheduler is a named template plus a repeat rule. It keeps at most one
//! pending instance in the queue: the instance is created when the scheduler
//! is upserted, and each time the current instance completes or fails for
//! good the next one is computed and added in the same transaction.
//!
//! Instances are ordinary jobs with the id `repeat-<key>-<due ms>`, so two
//! producers racing to create the same tick collide on the id instead of
//! producing duplicates.

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::{Job, JobData, JobId, JobOptions};
use crate::keys::{self, SEPARATOR};
use crate::protocol;
use crate::queue::QueueConfig;
use crate::store::Keyspace;
use chrono::{DateTime, Utc};
use conveyor_cron::CronExpression;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Computes the next due time (ms) strictly after a reference time, or
/// `None` to end the series. Arguments: reference, repeat options, job name.
pub type RepeatStrategy =
    Arc<dyn Fn(i64, &RepeatOptions, &str) -> QueueResult<Option<i64>> + Send + Sync>;

/// When a scheduler fires.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron pattern (5, 6 or 7 fields, UTC)
    pub pattern: Option<String>,
    /// Fixed interval (ms)
    pub every_ms: Option<u64>,
    /// First instance is due right away
    pub immediately: bool,
    /// No instance before this time (ms)
    pub start_date: Option<i64>,
    /// No instance after this time (ms)
    pub end_date: Option<i64>,
    /// Maximum number of instances
    pub limit: Option<u64>,
}

impl RepeatOptions {
    /// Fire on a cron pattern.
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Fire on every multiple of `interval`.
    pub fn every(interval: Duration) -> Self {
        Self {
            every_ms: Some(crate::clock::millis_u64(interval)),
            ..Self::default()
        }
    }

    /// Make the first instance due immediately.
    pub fn with_immediately(mut self) -> Self {
        self.immediately = true;
        self
    }

    /// Do not fire before `start`.
    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start.timestamp_millis());
        self
    }

    /// Do not fire after `end`.
    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end.timestamp_millis());
        self
    }

    /// Fire at most `limit` times.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the options.
    pub fn validate(&self) -> QueueResult<()> {
        match (&self.pattern, self.every_ms) {
            (Some(_), Some(_)) => {
                return Err(QueueError::InvalidRepeat(
                    "both pattern and every are set".into(),
                ));
            }
            (None, None) => {
                return Err(QueueError::InvalidRepeat(
                    "either pattern or every is required".into(),
                ));
            }
            (None, Some(0)) => {
                return Err(QueueError::InvalidRepeat("every must be non-zero".into()));
            }
            (Some(pattern), None) => {
                CronExpression::parse(pattern)?;
            }
            (None, Some(_)) => {}
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(QueueError::InvalidRepeat(
                    "end date is before start date".into(),
                ));
            }
        }
        if self.limit == Some(0) {
            return Err(QueueError::InvalidRepeat("limit must be at least 1".into()));
        }
        Ok(())
    }

    fn past_end(&self, due: i64) -> bool {
        self.end_date.is_some_and(|end| due > end)
    }
}

/// Default next-run computation.
///
/// Intervals snap to the next multiple of `every` after the reference; cron
/// patterns return their next occurrence after it. A start date raises the
/// reference so that the start itself may be due.
pub fn next_run(reference: i64, opts: &RepeatOptions, _name: &str) -> QueueResult<Option<i64>> {
    let reference = match opts.start_date {
        Some(start) => reference.max(start.saturating_sub(1)),
        None => reference,
    };
    let next = match (&opts.pattern, opts.every_ms) {
        (_, Some(every)) if every > 0 => {
            let every = i64::try_from(every).unwrap_or(i64::MAX);
            reference
                .div_euclid(every)
                .checked_add(1)
                .and_then(|n| n.checked_mul(every))
        }
        (Some(pattern), _) => CronExpression::parse(pattern)?.next_after_millis(reference),
        _ => return Err(QueueError::InvalidRepeat("no repeat rule".into())),
    };
    Ok(next.filter(|due| !opts.past_end(*due)))
}

/// The default [`RepeatStrategy`].
pub fn default_repeat_strategy() -> RepeatStrategy {
    Arc::new(next_run)
}

/// What each instance is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Job name
    pub name: String,
    /// Job data
    pub data: JobData,
    /// Job options; id, delay, parent and deduplication are managed by the
    /// scheduler
    pub opts: JobOptions,
}

impl JobTemplate {
    /// Template with default options.
    pub fn new(name: impl Into<String>, data: JobData) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    /// Set the instance options.
    pub fn with_options(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }
}

/// Stored scheduler record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobScheduler {
    /// Scheduler key
    pub key: String,
    /// Repeat rule
    pub repeat: RepeatOptions,
    /// Instance template
    pub template: JobTemplate,
    /// Instances produced so far
    pub iteration_count: u64,
    /// Due time of the latest instance
    pub next_millis: Option<i64>,
    /// The instance that will produce the next one
    pub pending_job_id: Option<JobId>,
    /// Creation time (ms)
    pub created_at: i64,
}

impl JobScheduler {
    fn limit_reached(&self) -> bool {
        self.repeat.limit.is_some_and(|l| self.iteration_count >= l)
    }
}

fn validate_key(key: &str) -> QueueResult<()> {
    if key.is_empty() || key.contains(SEPARATOR) {
        return Err(QueueError::InvalidRepeat(format!(
            "invalid scheduler key {:?}",
            key
        )));
    }
    Ok(())
}

/// Create or replace a scheduler and its pending instance.
pub(crate) fn upsert(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    key: &str,
    repeat: RepeatOptions,
    template: JobTemplate,
) -> QueueResult<Option<Job>> {
    validate_key(key)?;
    repeat.validate()?;
    if template.opts.parent.is_some() {
        return Err(QueueError::InvalidRepeat(
            "scheduled jobs cannot have a parent".into(),
        ));
    }
    let queue = config.queue_name.as_str();
    let q = ks.queue_mut(queue);
    let existing = q.schedulers.get(key);
    let iteration_count = existing.map(|s| s.iteration_count).unwrap_or(0);
    let created_at = existing.map(|s| s.created_at).unwrap_or(now);
    let stale_instance = existing
        .and_then(|s| s.pending_job_id.clone())
        .filter(|id| q.state_of(id).is_some_and(|s| s.is_pending()));

    let scheduler = JobScheduler {
        key: key.to_string(),
        repeat,
        template,
        iteration_count,
        next_millis: None,
        pending_job_id: None,
        created_at,
    };
    let due = if scheduler.limit_reached() {
        None
    } else if scheduler.repeat.immediately {
        Some(now.max(scheduler.repeat.start_date.unwrap_or(now)))
            .filter(|due| !scheduler.repeat.past_end(*due))
    } else {
        (config.settings.repeat_strategy)(now, &scheduler.repeat, &scheduler.template.name)?
    };

    if let Some(id) = stale_instance {
        if let Some(job) = q.delete_record(&id) {
            q.emit(
                now,
                QueueEvent::Removed {
                    job_id: id,
                    prev: job.state,
                },
            );
        }
    }
    q.schedulers.insert(key.to_string(), scheduler);
    debug!(queue = %queue, scheduler = %key, due = ?due, "Job scheduler upserted");

    match due {
        Some(due) => create_instance(ks, now, queue, key, due),
        None => Ok(None),
    }
}

/// Add the instance due at `due` and point the scheduler at it.
fn create_instance(
    ks: &mut Keyspace,
    now: i64,
    queue: &str,
    key: &str,
    due: i64,
) -> QueueResult<Option<Job>> {
    let q = ks.queue_mut(queue);
    let Some(scheduler) = q.schedulers.get(key) else {
        return Ok(None);
    };
    let id = keys::repeat_job_id(key, due);
    let mut opts = scheduler.template.opts.clone();
    opts.job_id = Some(id.clone());
    opts.delay_ms = due.saturating_sub(now).max(0) as u64;
    opts.parent = None;
    opts.deduplication = None;
    opts.timestamp = None;
    let mut job = Job::new(
        queue,
        id,
        scheduler.template.name.clone(),
        scheduler.template.data.clone(),
        opts,
        now,
    );
    job.repeat_job_key = Some(key.to_string());
    job.iteration = Some(scheduler.iteration_count + 1);

    let (job, created) = protocol::insert_job(ks, now, job, false, 0)?;
    let q = ks.queue_mut(queue);
    if let Some(scheduler) = q.schedulers.get_mut(key) {
        scheduler.next_millis = Some(due);
        if created {
            scheduler.iteration_count += 1;
            scheduler.pending_job_id = Some(job.id.clone());
        }
    }
    Ok(created.then_some(job))
}

/// Produce the instance following `finished`, if `finished` is its
/// scheduler's current instance.
pub(crate) fn produce_next(ks: &mut Keyspace, now: i64, config: &QueueConfig, finished: &Job) {
    let Some(key) = finished.repeat_job_key.as_deref() else {
        return;
    };
    let q = ks.queue_mut(&finished.queue);
    let Some(scheduler) = q.schedulers.get_mut(key) else {
        return;
    };
    if scheduler.pending_job_id.as_deref() != Some(finished.id.as_str()) {
        return;
    }
    scheduler.pending_job_id = None;
    if scheduler.limit_reached() {
        debug!(queue = %finished.queue, scheduler = %key, "Job scheduler reached its limit");
        return;
    }
    let reference = now.max(scheduler.next_millis.unwrap_or(now));
    let next = match (config.settings.repeat_strategy)(
        reference,
        &scheduler.repeat,
        &scheduler.template.name,
    ) {
        Ok(next) => next.filter(|due| !scheduler.repeat.past_end(*due)),
        Err(err) => {
            warn!(queue = %finished.queue, scheduler = %key, error = %err, "Repeat strategy failed, series ends");
            None
        }
    };
    let Some(due) = next else {
        scheduler.next_millis = None;
        return;
    };
    if let Err(err) = create_instance(ks, now, &finished.queue, key, due) {
        warn!(queue = %finished.queue, scheduler = %key, error = %err, "Failed to add next scheduled job");
    }
}

/// Delete a scheduler and its pending instance.
pub(crate) fn remove(ks: &mut Keyspace, now: i64, queue: &str, key: &str) -> bool {
    let Some(q) = ks.existing_queue_mut(queue) else {
        return false;
    };
    let Some(scheduler) = q.schedulers.remove(key) else {
        return false;
    };
    if let Some(id) = scheduler.pending_job_id {
        if q.state_of(&id).is_some_and(|s| s.is_pending()) {
            if let Some(job) = q.delete_record(&id) {
                q.emit(
                    now,
                    QueueEvent::Removed {
                        job_id: id,
                        prev: job.state,
                    },
                );
            }
        }
    }
    debug!(queue = %queue, scheduler = %key, "Job scheduler removed");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_snaps_to_next_multiple() {
        let opts = RepeatOptions::every(Duration::from_millis(1_000));
        assert_eq!(next_run(2_500, &opts, "t").unwrap(), Some(3_000));
        assert_eq!(next_run(3_000, &opts, "t").unwrap(), Some(4_000));
    }

    #[test]
    fn test_cron_next_occurrence() {
        // Every minute at second 0.
        let opts = RepeatOptions::cron("* * * * *");
        assert_eq!(next_run(61_000, &opts, "t").unwrap(), Some(120_000));
    }

    #[test]
    fn test_start_and_end_dates() {
        let mut opts = RepeatOptions::every(Duration::from_millis(1_000));
        opts.start_date = Some(10_000);
        assert_eq!(next_run(0, &opts, "t").unwrap(), Some(10_000));

        opts.end_date = Some(10_500);
        assert_eq!(next_run(10_000, &opts, "t").unwrap(), None);
    }

    #[test]
    fn test_validate() {
        assert!(RepeatOptions::every(Duration::from_secs(1)).validate().is_ok());
        assert!(RepeatOptions::cron("0 * * * *").validate().is_ok());
        assert!(RepeatOptions::default().validate().is_err());
        assert!(RepeatOptions::every(Duration::ZERO).validate().is_err());
        assert!(matches!(
            RepeatOptions::cron("not a cron").validate(),
            Err(QueueError::Cron(_))
        ));
        let both = RepeatOptions {
            pattern: Some("* * * * *".into()),
            every_ms: Some(5),
            ..RepeatOptions::default()
        };
        assert!(both.validate().is_err());
        assert!(RepeatOptions::every(Duration::from_secs(1)).with_limit(0).validate().is_err());
    }

    #[test]
    fn test_scheduler_keys() {
        assert!(validate_key("nightly").is_ok());
        assert!(validate_key("a:b").is_err());
        assert!(validate_key("").is_err());
    }
}
