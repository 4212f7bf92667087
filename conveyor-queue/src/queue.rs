//! Queue handle: producer, worker-facing and administrative API.

use crate::admin;
use crate::backoff::BackoffStrategy;
use crate::clock::{millis, millis_u64};
use crate::error::{QueueError, QueueResult};
use crate::events::{DEFAULT_MAX_EVENTS, QueueEvents};
use crate::flow::{self, Dependencies, DependencyCounts, DependencyQuery};
use crate::job::{Job, JobData, JobId, JobOptions, JobState};
use crate::keys;
use crate::limiter::{self, RateLimiterOptions};
use crate::protocol::{self, ClaimOutcome, ClaimRequest};
use crate::repeat::{self, JobScheduler, JobTemplate, RepeatOptions, RepeatStrategy};
use crate::stalled::{self, StalledReport};
use crate::store::{Keyspace, MemoryStore};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Pluggable per-queue strategies.
#[derive(Clone)]
pub struct QueueSettings {
    /// Next-run computation for job schedulers
    pub repeat_strategy: RepeatStrategy,
    /// Delays for `Backoff::Custom`
    pub backoff_strategy: Option<BackoffStrategy>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            repeat_strategy: repeat::default_repeat_strategy(),
            backoff_strategy: None,
        }
    }
}

impl fmt::Debug for QueueSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSettings")
            .field("backoff_strategy", &self.backoff_strategy.is_some())
            .finish_non_exhaustive()
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name
    pub queue_name: String,

    /// Maximum number of waiting, paused, prioritized and delayed jobs
    /// (0 = unlimited)
    pub max_size: usize,

    /// Options used by [`Queue::add`]
    pub default_job_options: JobOptions,

    /// Events kept in the queue's log
    pub max_events: usize,

    /// Strategies
    pub settings: QueueSettings,
}

impl QueueConfig {
    /// Create a new queue configuration.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_size: 0,
            default_job_options: JobOptions::default(),
            max_events: DEFAULT_MAX_EVENTS,
            settings: QueueSettings::default(),
        }
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the options used when none are given.
    pub fn with_default_job_options(mut self, opts: JobOptions) -> Self {
        self.default_job_options = opts;
        self
    }

    /// Set the number of events kept.
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Replace the scheduler strategy.
    pub fn with_repeat_strategy(mut self, strategy: RepeatStrategy) -> Self {
        self.settings.repeat_strategy = strategy;
        self
    }

    /// Set the custom backoff strategy.
    pub fn with_backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.settings.backoff_strategy = Some(strategy);
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::Config("queue name must not be empty".into()));
        }
        if self.max_events == 0 {
            return Err(QueueError::Config("max_events must be at least 1".into()));
        }
        if let Some(id) = &self.default_job_options.job_id {
            return Err(QueueError::Config(format!(
                "default job options must not carry a job id ({})",
                id
            )));
        }
        Ok(())
    }
}

/// One job of a bulk add.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkJob {
    /// Job name
    pub name: String,
    /// Job data
    pub data: JobData,
    /// Options; `None` uses the queue's defaults
    pub opts: Option<JobOptions>,
}

impl BulkJob {
    /// Job with default options.
    pub fn new(name: impl Into<String>, data: JobData) -> Self {
        Self {
            name: name.into(),
            data,
            opts: None,
        }
    }

    /// Set the options.
    pub fn with_options(mut self, opts: JobOptions) -> Self {
        self.opts = Some(opts);
        self
    }
}

/// Handle on one queue of a store. Cloning is cheap.
#[derive(Clone)]
pub struct Queue {
    store: MemoryStore,
    config: Arc<QueueConfig>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.config.queue_name)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Open `queue_name` with the default configuration.
    pub fn new(store: MemoryStore, queue_name: impl Into<String>) -> QueueResult<Self> {
        Self::with_config(store, QueueConfig::new(queue_name))
    }

    /// Open a queue with custom configuration.
    pub fn with_config(store: MemoryStore, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        debug!(
            queue = %config.queue_name,
            max_size = config.max_size,
            max_events = config.max_events,
            "Opening queue"
        );
        store.transact(|ks, _| {
            admin::trim_events(ks, &config.queue_name, config.max_events);
            Ok(())
        })?;
        info!(queue = %config.queue_name, "Queue ready");
        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.config.queue_name
    }

    /// Configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Event observer for this queue.
    pub fn events(&self) -> QueueEvents {
        QueueEvents::new(self.store.clone(), self.name())
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.store.notifier(self.name())
    }

    fn transact<R>(&self, f: impl FnOnce(&mut Keyspace, i64, &QueueConfig) -> QueueResult<R>) -> QueueResult<R> {
        let config: &QueueConfig = &self.config;
        self.store.transact(|ks, now| f(ks, now, config))
    }

    // ========== Producer ==========

    /// Add a job with the default options.
    pub async fn add(&self, name: impl Into<String>, data: JobData) -> QueueResult<Job> {
        let opts = self.config.default_job_options.clone();
        self.add_with_options(name, data, opts).await
    }

    /// Add a job.
    pub async fn add_with_options(
        &self,
        name: impl Into<String>,
        data: JobData,
        opts: JobOptions,
    ) -> QueueResult<Job> {
        let name = name.into();
        self.transact(|ks, now, config| protocol::add_job(ks, now, config, name, data, opts, false))
    }

    /// Add several jobs in one transaction; either all are added or none.
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> QueueResult<Vec<Job>> {
        self.transact(|ks, now, config| {
            let mut added = 0;
            for job in &jobs {
                let opts = job.opts.as_ref().unwrap_or(&config.default_job_options);
                if let Some(id) = &opts.job_id {
                    keys::validate_job_id(id)?;
                    if ks.job(&config.queue_name, id).is_some() {
                        continue;
                    }
                }
                if let Some(parent) = &opts.parent {
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
                added += 1;
            }
            if config.max_size > 0 {
                let pending = ks
                    .queue(&config.queue_name)
                    .map(|q| {
                        q.count(JobState::Waiting)
                            + q.count(JobState::Paused)
                            + q.count(JobState::Prioritized)
                            + q.count(JobState::Delayed)
                    })
                    .unwrap_or(0);
                if pending + added > config.max_size {
                    return Err(QueueError::QueueFull);
                }
            }
            jobs.into_iter()
                .map(|job| {
                    let opts = job.opts.unwrap_or_else(|| config.default_job_options.clone());
                    protocol::add_job(ks, now, config, job.name, job.data, opts, false)
                })
                .collect()
        })
    }

    // ========== Worker-facing transitions ==========

    /// Claim the next eligible job under a new lock owned by `token`.
    pub async fn claim(
        &self,
        token: &str,
        worker: &str,
        lock_duration: Duration,
        limiter: Option<&RateLimiterOptions>,
    ) -> QueueResult<ClaimOutcome> {
        let req = ClaimRequest {
            token,
            worker,
            lock_duration_ms: millis(lock_duration),
            limiter,
        };
        self.transact(|ks, now, config| protocol::claim(ks, now, &config.queue_name, req))
    }

    /// Complete an active job.
    pub async fn complete(
        &self,
        job_id: &str,
        token: &str,
        return_value: serde_json::Value,
    ) -> QueueResult<Job> {
        self.transact(|ks, now, config| protocol::complete(ks, now, config, job_id, token, return_value))
    }

    /// Fail an active job. Recoverable failures are retried while attempts
    /// remain.
    pub async fn fail(
        &self,
        job_id: &str,
        token: &str,
        reason: impl Into<String>,
        unrecoverable: bool,
    ) -> QueueResult<Job> {
        let reason = reason.into();
        self.transact(|ks, now, config| {
            protocol::fail(ks, now, config, job_id, token, &reason, unrecoverable)
        })
    }

    /// Put a throttled active job back at the head of the queue without
    /// counting the attempt.
    pub async fn release_rate_limited(&self, job_id: &str, token: &str) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            protocol::release_rate_limited(ks, now, &config.queue_name, job_id, token)
        })
    }

    /// Block an active job until its children finish. Returns `false` when
    /// nothing (or not `child`) is pending.
    pub async fn move_to_waiting_children(
        &self,
        job_id: &str,
        token: &str,
        child: Option<&str>,
    ) -> QueueResult<bool> {
        self.transact(|ks, now, config| {
            protocol::move_to_waiting_children(ks, now, &config.queue_name, job_id, token, child)
        })
    }

    /// Park an active job until `timestamp` (ms) without counting the
    /// attempt.
    pub async fn move_to_delayed(&self, job_id: &str, token: &str, timestamp: i64) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            protocol::move_to_delayed(ks, now, &config.queue_name, job_id, token, timestamp)
        })
    }

    /// Extend a lock. Returns `false` when the lock is gone or not ours.
    pub async fn extend_lock(&self, job_id: &str, token: &str, duration: Duration) -> bool {
        self.transact(|ks, now, config| {
            Ok(protocol::extend_lock(
                ks,
                now,
                &config.queue_name,
                job_id,
                token,
                millis(duration),
            ))
        })
        .unwrap_or(false)
    }

    /// Run one stalled-job sweep, unless another sweep ran less than
    /// `interval` ago.
    pub async fn check_stalled(
        &self,
        max_stalled_count: u32,
        interval: Duration,
    ) -> QueueResult<StalledReport> {
        self.transact(|ks, now, config| {
            Ok(stalled::check_stalled(ks, now, config, max_stalled_count, millis(interval)))
        })
    }

    // ========== Job transitions ==========

    /// Make a delayed job ready now.
    pub async fn promote(&self, job_id: &str) -> QueueResult<()> {
        self.transact(|ks, now, config| protocol::promote(ks, now, &config.queue_name, job_id))
    }

    /// Re-schedule a delayed job `delay` from now.
    pub async fn change_delay(&self, job_id: &str, delay: Duration) -> QueueResult<()> {
        let delay_ms = millis_u64(delay);
        self.transact(|ks, now, config| {
            protocol::change_delay(ks, now, &config.queue_name, job_id, delay_ms)
        })
    }

    /// Change the priority of a waiting, paused or prioritized job.
    pub async fn change_priority(&self, job_id: &str, priority: u32, lifo: bool) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            protocol::change_priority(ks, now, &config.queue_name, job_id, priority, lifo)
        })
    }

    /// Remove a job (and its descendants with `remove_children`). Returns
    /// `false` when the job does not exist.
    pub async fn remove(&self, job_id: &str, remove_children: bool) -> QueueResult<bool> {
        self.transact(|ks, now, config| {
            protocol::remove(ks, now, &config.queue_name, job_id, remove_children)
        })
    }

    /// Retry a failed or completed job.
    pub async fn retry_job(&self, job_id: &str) -> QueueResult<()> {
        self.transact(|ks, now, config| admin::retry_job(ks, now, &config.queue_name, job_id))
    }

    /// Replace a job's data.
    pub async fn update_data(&self, job_id: &str, data: JobData) -> QueueResult<()> {
        self.transact(|ks, _, config| admin::update_data(ks, &config.queue_name, job_id, data))
    }

    /// Record job progress.
    pub async fn update_progress(&self, job_id: &str, progress: serde_json::Value) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            admin::update_progress(ks, now, &config.queue_name, job_id, progress)
        })
    }

    /// Append a log line to a job. Returns the number of lines kept.
    pub async fn add_log(&self, job_id: &str, line: impl Into<String>) -> QueueResult<usize> {
        let line = line.into();
        self.transact(|ks, _, config| admin::add_log(ks, &config.queue_name, job_id, line))
    }

    // ========== Administration ==========

    /// Pause the queue. Workers stop claiming until it is resumed.
    pub async fn pause(&self) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            admin::pause(ks, now, &config.queue_name);
            Ok(())
        })
    }

    /// Resume the queue.
    pub async fn resume(&self) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            admin::resume(ks, now, &config.queue_name);
            Ok(())
        })
    }

    /// Whether the queue is paused.
    pub async fn is_paused(&self) -> bool {
        self.store
            .read(|ks| ks.queue(self.name()).is_some_and(|q| q.is_paused()))
    }

    /// Delete every ready job, and delayed jobs when `delayed` is set.
    pub async fn drain(&self, delayed: bool) -> QueueResult<usize> {
        self.transact(|ks, now, config| Ok(admin::drain(ks, now, &config.queue_name, delayed)))
    }

    /// Delete up to `limit` jobs (0 = all) in `state` older than `grace`.
    pub async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> QueueResult<Vec<JobId>> {
        self.transact(|ks, now, config| {
            Ok(admin::clean(ks, now, &config.queue_name, grace, limit, state))
        })
    }

    /// Retry every job in `state` (failed or completed) that finished at or
    /// before `timestamp` (default: now).
    pub async fn retry_jobs(&self, state: JobState, timestamp: Option<i64>) -> QueueResult<usize> {
        self.transact(|ks, now, config| {
            admin::retry_jobs(ks, now, &config.queue_name, state, timestamp)
        })
    }

    /// Promote up to `limit` delayed jobs (0 = all).
    pub async fn promote_jobs(&self, limit: usize) -> QueueResult<usize> {
        self.transact(|ks, now, config| Ok(admin::promote_jobs(ks, now, &config.queue_name, limit)))
    }

    /// Cap the number of active jobs across all workers.
    pub async fn set_global_concurrency(&self, concurrency: Option<usize>) -> QueueResult<()> {
        self.transact(|ks, _, config| {
            admin::set_global_concurrency(ks, &config.queue_name, concurrency);
            Ok(())
        })
    }

    /// Set a limiter that overrides the workers' limiters.
    pub async fn set_global_rate_limit(&self, limiter: Option<RateLimiterOptions>) -> QueueResult<()> {
        self.transact(|ks, _, config| admin::set_global_rate_limit(ks, &config.queue_name, limiter))
    }

    /// Throttle the whole queue for `expire`.
    pub async fn rate_limit(&self, expire: Duration) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            admin::rate_limit(ks, now, &config.queue_name, expire);
            Ok(())
        })
    }

    /// Throttle one group for `expire`.
    pub async fn rate_limit_group(&self, group: &str, expire: Duration) -> QueueResult<()> {
        self.transact(|ks, now, config| {
            admin::rate_limit_group(ks, now, &config.queue_name, group, expire);
            Ok(())
        })
    }

    /// Clear the queue's rate-limit window.
    pub async fn remove_rate_limit_key(&self) -> QueueResult<()> {
        self.transact(|ks, _, config| {
            ks.queue_mut(&config.queue_name).limiter = None;
            Ok(())
        })
    }

    /// Remaining time of the queue's window when it is exhausted for
    /// `max_jobs` (default: the global limiter's max, or a throttle).
    pub async fn get_rate_limit_ttl(&self, max_jobs: Option<u64>) -> Option<Duration> {
        let now = self.store.now_ms();
        self.store.read(|ks| {
            let q = ks.queue(self.name())?;
            let max = max_jobs
                .or_else(|| q.meta.limiter.as_ref().map(|l| l.max))
                .unwrap_or(u64::MAX);
            limiter::window_ttl(q.limiter.as_ref(), now, max)
                .map(|ttl| Duration::from_millis(ttl.max(0) as u64))
        })
    }

    /// Keep at most `max_len` events.
    pub async fn trim_events(&self, max_len: usize) -> QueueResult<()> {
        self.transact(|ks, _, config| {
            admin::trim_events(ks, &config.queue_name, max_len);
            Ok(())
        })
    }

    // ========== Schedulers ==========

    /// Create or replace a job scheduler. Returns the new pending instance.
    pub async fn upsert_job_scheduler(
        &self,
        key: &str,
        repeat: RepeatOptions,
        template: JobTemplate,
    ) -> QueueResult<Option<Job>> {
        let job = self.transact(|ks, now, config| repeat::upsert(ks, now, config, key, repeat, template))?;
        info!(queue = %self.name(), scheduler = %key, "Job scheduler upserted");
        Ok(job)
    }

    /// Delete a job scheduler and its pending instance.
    pub async fn remove_job_scheduler(&self, key: &str) -> QueueResult<bool> {
        self.transact(|ks, now, config| Ok(repeat::remove(ks, now, &config.queue_name, key)))
    }

    /// A scheduler record.
    pub async fn get_job_scheduler(&self, key: &str) -> Option<JobScheduler> {
        self.store
            .read(|ks| ks.queue(self.name())?.schedulers.get(key).cloned())
    }

    /// Every scheduler record, by key.
    pub async fn get_job_schedulers(&self) -> Vec<JobScheduler> {
        self.store.read(|ks| {
            ks.queue(self.name())
                .map(|q| q.schedulers.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    // ========== Reads ==========

    /// A job record.
    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.store.read(|ks| ks.job(self.name(), job_id).cloned())
    }

    /// A job's state.
    pub async fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.store
            .read(|ks| ks.queue(self.name())?.state_of(job_id))
    }

    /// Number of jobs per state (all states when `states` is empty).
    pub async fn get_job_counts(&self, states: &[JobState]) -> HashMap<JobState, usize> {
        let states = if states.is_empty() {
            &JobState::ALL[..]
        } else {
            states
        };
        self.store.read(|ks| {
            states
                .iter()
                .map(|s| (*s, ks.queue(self.name()).map(|q| q.count(*s)).unwrap_or(0)))
                .collect()
        })
    }

    /// Total of waiting, paused, prioritized and delayed jobs.
    pub async fn count(&self) -> usize {
        self.get_job_counts(&[
            JobState::Waiting,
            JobState::Paused,
            JobState::Prioritized,
            JobState::Delayed,
        ])
        .await
        .values()
        .sum()
    }

    /// Jobs in `states`, concatenated in the given order, from index
    /// `start` to `end` inclusive (`None` = to the end). `asc` lists each
    /// state oldest first.
    pub async fn get_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: Option<usize>,
        asc: bool,
    ) -> Vec<Job> {
        self.store.read(|ks| {
            let Some(q) = ks.queue(self.name()) else {
                return Vec::new();
            };
            let ids = states.iter().flat_map(|s| {
                let mut ids = q.ids(*s);
                if !asc {
                    ids.reverse();
                }
                ids
            });
            let take = end.map(|e| e.saturating_sub(start) + 1).unwrap_or(usize::MAX);
            ids.skip(start)
                .take(take)
                .filter_map(|id| q.job(&id).cloned())
                .collect()
        })
    }

    /// A job's log lines, oldest first.
    pub async fn get_logs(&self, job_id: &str) -> Vec<String> {
        self.store.read(|ks| {
            ks.queue(self.name())
                .and_then(|q| q.logs.get(job_id))
                .map(|logs| logs.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    // ========== Dependencies ==========

    /// Page through a parent's children.
    pub async fn get_dependencies(&self, job_id: &str, query: DependencyQuery) -> QueueResult<Dependencies> {
        self.store.read(|ks| {
            let q = ks
                .queue(self.name())
                .filter(|q| q.job(job_id).is_some())
                .ok_or_else(|| QueueError::MissingKey(job_id.to_string()))?;
            Ok(q.dependencies
                .get(job_id)
                .map(|deps| flow::list_dependencies(deps, &query))
                .unwrap_or_else(|| flow::list_dependencies(&Default::default(), &query)))
        })
    }

    /// Number of children per list.
    pub async fn get_dependencies_count(&self, job_id: &str) -> QueueResult<DependencyCounts> {
        self.store.read(|ks| {
            let q = ks
                .queue(self.name())
                .filter(|q| q.job(job_id).is_some())
                .ok_or_else(|| QueueError::MissingKey(job_id.to_string()))?;
            Ok(q.dependencies
                .get(job_id)
                .map(|d| DependencyCounts {
                    processed: d.processed.len(),
                    pending: d.pending.len(),
                    failed: d.failed.len(),
                })
                .unwrap_or_default())
        })
    }

    /// Return values of completed children, by child key.
    pub async fn get_children_values(&self, job_id: &str) -> BTreeMap<String, serde_json::Value> {
        self.store.read(|ks| {
            ks.queue(self.name())
                .and_then(|q| q.dependencies.get(job_id))
                .map(|d| d.processed.clone())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new(MemoryStore::with_clock(ManualClock::new(0)), "test").unwrap()
    }

    #[test]
    fn test_queue_config() {
        let config = QueueConfig::new("test");
        assert_eq!(config.queue_name, "test");
        assert_eq!(config.max_size, 0); // 0 means unlimited
        assert_eq!(config.max_events, DEFAULT_MAX_EVENTS);
        assert!(config.settings.backoff_strategy.is_none());
    }

    #[test]
    fn test_queue_config_validation() {
        assert!(QueueConfig::new("").validate().is_err());
        assert!(QueueConfig::new("q").with_max_events(0).validate().is_err());
        let with_id = QueueConfig::new("q").with_default_job_options(JobOptions::new().with_job_id("1"));
        assert!(with_id.validate().is_err());
        assert!(QueueConfig::new("q").with_max_size(1000).validate().is_ok());
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let queue = queue();
        let job = queue.add("email", json!({"to": "a@b.c"})).await.unwrap();
        assert_eq!(queue.get_state(&job.id).await, Some(JobState::Waiting));
        assert_eq!(queue.get_job(&job.id).await.unwrap().name, "email");
        assert_eq!(queue.count().await, 1);
    }

    #[tokio::test]
    async fn test_add_bulk_is_all_or_nothing() {
        let queue = queue();
        let jobs = vec![
            BulkJob::new("a", json!(1)),
            BulkJob::new("b", json!(2)).with_options(JobOptions::new().with_job_id("bad:id")),
        ];
        assert!(queue.add_bulk(jobs).await.is_err());
        assert_eq!(queue.count().await, 0);

        let added = queue
            .add_bulk(vec![BulkJob::new("a", json!(1)), BulkJob::new("b", json!(2))])
            .await
            .unwrap();
        assert_eq!(added.len(), 2);
    }

    #[tokio::test]
    async fn test_get_jobs_ranges() {
        let queue = queue();
        for n in 0..4 {
            queue.add("n", json!(n)).await.unwrap();
        }
        let ids = |jobs: Vec<Job>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids(queue.get_jobs(&[JobState::Waiting], 1, Some(2), true).await), vec!["2", "3"]);
        assert_eq!(ids(queue.get_jobs(&[JobState::Waiting], 0, Some(0), false).await), vec!["4"]);
        assert_eq!(queue.get_jobs(&[JobState::Waiting], 0, None, true).await.len(), 4);
    }

    #[tokio::test]
    async fn test_job_counts() {
        let queue = queue();
        queue.add("a", json!(null)).await.unwrap();
        queue
            .add_with_options("b", json!(null), JobOptions::new().with_delay(Duration::from_secs(1)))
            .await
            .unwrap();
        let counts = queue.get_job_counts(&[]).await;
        assert_eq!(counts[&JobState::Waiting], 1);
        assert_eq!(counts[&JobState::Delayed], 1);
        assert_eq!(counts[&JobState::Failed], 0);
        assert_eq!(counts.len(), JobState::ALL.len());
    }

    #[tokio::test]
    async fn test_rate_limit_ttl() {
        let queue = queue();
        assert_eq!(queue.get_rate_limit_ttl(None).await, None);
        queue.rate_limit(Duration::from_millis(800)).await.unwrap();
        assert_eq!(queue.get_rate_limit_ttl(None).await, Some(Duration::from_millis(800)));
        queue.remove_rate_limit_key().await.unwrap();
        assert_eq!(queue.get_rate_limit_ttl(None).await, None);
    }

    #[tokio::test]
    async fn test_progress_and_logs() {
        let queue = queue();
        let job = queue
            .add_with_options("a", json!(null), JobOptions::new().with_keep_logs(5))
            .await
            .unwrap();
        queue.update_progress(&job.id, json!(50)).await.unwrap();
        queue.add_log(&job.id, "step one").await.unwrap();
        assert_eq!(queue.get_job(&job.id).await.unwrap().progress, json!(50));
        assert_eq!(queue.get_logs(&job.id).await, vec!["step one".to_string()]);
        assert!(queue.update_data("missing", json!(1)).await.is_err());
    }
}
