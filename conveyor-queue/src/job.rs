//! Job definition and options.

use crate::keys;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Job identifier: a per-queue counter or a caller-supplied string.
pub type JobId = String;

/// Job payload data.
pub type JobData = serde_json::Value;

/// Lifecycle state. Each state names exactly one state set of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Ready, in the wait list
    Waiting,
    /// Ready, but the queue is paused
    Paused,
    /// Ready, ordered by priority
    Prioritized,
    /// Waiting for its due time
    Delayed,
    /// Claimed by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
    /// Blocked on unfinished children
    WaitingChildren,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 8] = [
        JobState::Waiting,
        JobState::Paused,
        JobState::Prioritized,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::WaitingChildren,
    ];

    /// State name as used in events and counts.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Paused => "paused",
            JobState::Prioritized => "prioritized",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::WaitingChildren => "waiting-children",
        }
    }

    /// Ready to be claimed (or would be, if the queue were running).
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            JobState::Waiting | JobState::Paused | JobState::Prioritized
        )
    }

    /// Not yet claimed: ready or delayed.
    pub fn is_pending(&self) -> bool {
        self.is_ready() || *self == JobState::Delayed
    }

    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a child to its parent, possibly in another queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// Queue holding the parent
    pub queue: String,
    /// Parent job id
    pub id: JobId,
}

impl ParentRef {
    /// Create a parent reference.
    pub fn new(queue: impl Into<String>, id: impl Into<JobId>) -> Self {
        Self {
            queue: queue.into(),
            id: id.into(),
        }
    }

    /// Fully qualified parent key.
    pub fn key(&self) -> String {
        keys::job_key(&self.queue, &self.id)
    }
}

/// What a terminal child failure does to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParentFailurePolicy {
    /// The parent stays in waiting-children.
    #[default]
    Keep,
    /// The parent fails with reason `child <key> failed`, recursively.
    FailParent,
    /// The failure is recorded and the dependency counts as resolved.
    IgnoreDependency,
    /// The dependency is dropped without a record.
    RemoveDependency,
}

/// Retention policy for finished jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepJobs {
    /// Keep every finished job.
    #[default]
    All,
    /// Remove the job as soon as it finishes.
    None,
    /// Keep at most this many finished jobs.
    Count(usize),
    /// Keep jobs younger than `age_ms`, and at most `count` of them.
    Age {
        /// Maximum age in milliseconds
        age_ms: u64,
        /// Optional count cap
        count: Option<usize>,
    },
}

/// Retry delay policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Backoff {
    /// Same delay on every retry.
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
        /// Random reduction in `[0, 1]`
        #[serde(default)]
        jitter: f64,
    },
    /// `2^(attempts_made - 1) * delay`.
    Exponential {
        /// Base delay in milliseconds
        delay_ms: u64,
        /// Random reduction in `[0, 1]`
        #[serde(default)]
        jitter: f64,
    },
    /// Delegated to the queue's backoff strategy under this name.
    Custom {
        /// Strategy name
        name: String,
    },
}

impl Backoff {
    /// Fixed backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: crate::clock::millis_u64(delay),
            jitter: 0.0,
        }
    }

    /// Exponential backoff.
    pub fn exponential(delay: Duration) -> Self {
        Self::Exponential {
            delay_ms: crate::clock::millis_u64(delay),
            jitter: 0.0,
        }
    }

    /// Custom backoff resolved by the queue's strategy.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom { name: name.into() }
    }

    /// Set the jitter of a fixed or exponential backoff.
    pub fn with_jitter(mut self, value: f64) -> Self {
        let value = value.clamp(0.0, 1.0);
        match &mut self {
            Backoff::Fixed { jitter, .. } | Backoff::Exponential { jitter, .. } => *jitter = value,
            Backoff::Custom { .. } => {}
        }
        self
    }
}

/// Debounce a job by id: while the entry lives, adds with the same id are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduplication {
    /// Deduplication id
    pub id: String,
    /// Lifetime in milliseconds; without it the entry lives until the job
    /// finishes or is removed.
    pub ttl_ms: Option<u64>,
}

/// Options given when adding a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Caller-supplied id
    pub job_id: Option<JobId>,
    /// 0 means no priority; otherwise lower runs first
    pub priority: u32,
    /// Delay in milliseconds before the job becomes ready
    pub delay_ms: u64,
    /// Total attempts, including the first
    pub attempts: u32,
    /// Retry delay
    pub backoff: Option<Backoff>,
    /// Insert at the head of the wait list
    pub lifo: bool,
    /// Creation timestamp override (ms)
    pub timestamp: Option<i64>,
    /// Retention after completion
    pub remove_on_complete: KeepJobs,
    /// Retention after terminal failure
    pub remove_on_fail: KeepJobs,
    /// Maximum log lines kept
    pub keep_logs: Option<usize>,
    /// Maximum stack traces kept
    pub stack_trace_limit: usize,
    /// Parent of this job
    pub parent: Option<ParentRef>,
    /// Effect of a terminal failure on the parent
    pub on_parent_failure: ParentFailurePolicy,
    /// Debounce settings
    pub deduplication: Option<Deduplication>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            priority: 0,
            delay_ms: 0,
            attempts: 1,
            backoff: None,
            lifo: false,
            timestamp: None,
            remove_on_complete: KeepJobs::All,
            remove_on_fail: KeepJobs::All,
            keep_logs: None,
            stack_trace_limit: 10,
            parent: None,
            on_parent_failure: ParentFailurePolicy::Keep,
            deduplication: None,
        }
    }
}

impl JobOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a caller-supplied job id.
    pub fn with_job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set job priority (0 = none, 1 = highest).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = crate::clock::millis_u64(delay);
        self
    }

    /// Set total attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Insert at the head of the wait list.
    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Set the retention policy for completed jobs.
    pub fn with_remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = keep;
        self
    }

    /// Set the retention policy for failed jobs.
    pub fn with_remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = keep;
        self
    }

    /// Bound the job's log list.
    pub fn with_keep_logs(mut self, lines: usize) -> Self {
        self.keep_logs = Some(lines);
        self
    }

    /// Bound the job's stack traces.
    pub fn with_stack_trace_limit(mut self, limit: usize) -> Self {
        self.stack_trace_limit = limit;
        self
    }

    /// Attach the job to a parent.
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set what a terminal failure does to the parent.
    pub fn with_parent_failure(mut self, policy: ParentFailurePolicy) -> Self {
        self.on_parent_failure = policy;
        self
    }

    /// Debounce by id.
    pub fn with_deduplication(mut self, id: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.deduplication = Some(Deduplication {
            id: id.into(),
            ttl_ms: ttl.map(crate::clock::millis_u64),
        });
        self
    }
}

/// A job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier
    pub id: JobId,

    /// Queue name
    pub queue: String,

    /// Job name
    pub name: String,

    /// Job payload data
    pub data: JobData,

    /// Options the job was added with
    pub opts: JobOptions,

    /// Current state
    pub state: JobState,

    /// Progress reported by the handler
    pub progress: serde_json::Value,

    /// Creation time (ms)
    pub timestamp: i64,

    /// Current delay (ms)
    pub delay_ms: u64,

    /// Current priority
    pub priority: u32,

    /// Attempts counted against `opts.attempts`
    pub attempts_made: u32,

    /// Times the job was claimed
    pub attempts_started: u32,

    /// Times the job was found stalled
    pub stalled_counter: u32,

    /// Last claim time (ms)
    pub processed_on: Option<i64>,

    /// Finish time (ms)
    pub finished_on: Option<i64>,

    /// Worker that last claimed the job
    pub processed_by: Option<String>,

    /// Handler result
    pub return_value: Option<serde_json::Value>,

    /// Last failure reason
    pub failed_reason: Option<String>,

    /// Recent failure traces, oldest first
    pub stacktrace: Vec<String>,

    /// Parent reference
    pub parent: Option<ParentRef>,

    /// Scheduler that produced this job
    pub repeat_job_key: Option<String>,

    /// Iteration number within its scheduler
    pub iteration: Option<u64>,

    /// Deduplication id
    pub deduplication_id: Option<String>,

    /// When a group limit first pushed the job back since its last claim (ms)
    #[serde(default)]
    pub rate_limited_since: Option<i64>,
}

impl Job {
    /// Create a job record in the waiting state.
    pub fn new(
        queue: impl Into<String>,
        id: impl Into<JobId>,
        name: impl Into<String>,
        data: JobData,
        opts: JobOptions,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            name: name.into(),
            data,
            state: JobState::Waiting,
            progress: serde_json::Value::from(0),
            timestamp: opts.timestamp.unwrap_or(timestamp),
            delay_ms: opts.delay_ms,
            priority: opts.priority,
            attempts_made: 0,
            attempts_started: 0,
            stalled_counter: 0,
            processed_on: None,
            finished_on: None,
            processed_by: None,
            return_value: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            parent: opts.parent.clone(),
            repeat_job_key: None,
            iteration: None,
            deduplication_id: opts.deduplication.as_ref().map(|d| d.id.clone()),
            rate_limited_since: None,
            opts,
        }
    }

    /// Fully qualified key (`<queue>:<id>`).
    pub fn key(&self) -> String {
        keys::job_key(&self.queue, &self.id)
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_default()
    }

    /// Whether another attempt is allowed after a recoverable failure.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }

    /// Whether the job reached completed or failed.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Record a failure trace, keeping the newest `stack_trace_limit`.
    pub(crate) fn push_stacktrace(&mut self, trace: String) {
        let limit = self.opts.stack_trace_limit;
        if limit == 0 {
            return;
        }
        self.stacktrace.push(trace);
        if self.stacktrace.len() > limit {
            let excess = self.stacktrace.len() - limit;
            self.stacktrace.drain(..excess);
        }
    }
}
