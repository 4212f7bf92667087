//! Worker: claims jobs, runs the processor and records the outcome.
//!
//! A worker runs `concurrency` poll slots. Each slot claims one job at a
//! time, keeps its lock alive while the processor runs and finishes the job
//! with the same token. Idle slots sleep until the queue's notifier fires,
//! the next delayed job is due or `drain_delay` elapses. A separate task
//! runs the stalled-job sweep every `stalled_interval`.

use crate::error::{JobError, QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::limiter::RateLimiterOptions;
use crate::lock::{new_token, spawn_lock_renewal};
use crate::protocol::ClaimOutcome;
use crate::queue::Queue;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WORKER_EVENT_CAPACITY: usize = 256;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Processes claimed jobs.
///
/// Implemented for every `Fn(ActiveJob, CancellationToken) -> Future`
/// closure. The token is cancelled when the worker is force-closed, when
/// the job is cancelled through [`Worker::cancel_job`], or when its lock is
/// lost.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Run one job and return its result.
    async fn process(&self, job: ActiveJob, cancel: CancellationToken) -> Result<serde_json::Value, JobError>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(ActiveJob, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn process(&self, job: ActiveJob, cancel: CancellationToken) -> Result<serde_json::Value, JobError> {
        (self)(job, cancel).await
    }
}

/// Worker options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name recorded as `processed_by`
    pub name: String,

    /// Number of jobs processed at once
    pub concurrency: usize,

    /// Worker-side rate limiter (a queue-wide limiter takes precedence)
    pub limiter: Option<RateLimiterOptions>,

    /// Start polling on construction
    pub autorun: bool,

    /// Lock duration of claimed jobs
    pub lock_duration: Duration,

    /// Renewal period (defaults to half the lock duration)
    pub lock_renew_time: Option<Duration>,

    /// Period of the stalled-job sweep
    pub stalled_interval: Duration,

    /// Stalls tolerated before a job fails
    pub max_stalled_count: u32,

    /// Do not run the stalled-job sweep from this worker
    pub skip_stalled_check: bool,

    /// Longest idle wait between claims
    pub drain_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            concurrency: 1,
            limiter: None,
            autorun: true,
            lock_duration: Duration::from_secs(30),
            lock_renew_time: None,
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            skip_stalled_check: false,
            drain_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerOptions {
    /// Set the worker name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the worker-side limiter.
    pub fn with_limiter(mut self, limiter: RateLimiterOptions) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Start on construction or wait for [`Worker::run`].
    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    /// Set the lock duration.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    /// Set the lock renewal period.
    pub fn with_lock_renew_time(mut self, every: Duration) -> Self {
        self.lock_renew_time = Some(every);
        self
    }

    /// Set the stalled sweep period.
    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    /// Set the number of stalls tolerated.
    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    /// Leave the stalled sweep to other workers.
    pub fn with_skip_stalled_check(mut self, skip: bool) -> Self {
        self.skip_stalled_check = skip;
        self
    }

    /// Set the longest idle wait.
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    /// Effective renewal period.
    pub fn renew_every(&self) -> Duration {
        self.lock_renew_time.unwrap_or(self.lock_duration / 2)
    }

    /// Check the options.
    pub fn validate(&self) -> QueueResult<()> {
        if self.name.is_empty() {
            return Err(QueueError::Config("worker name must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.lock_duration.is_zero() {
            return Err(QueueError::Config("lock duration must be positive".into()));
        }
        let renew = self.renew_every();
        if renew.is_zero() || renew >= self.lock_duration {
            return Err(QueueError::Config(
                "lock renew time must be positive and shorter than the lock duration".into(),
            ));
        }
        if !self.skip_stalled_check && self.stalled_interval.is_zero() {
            return Err(QueueError::Config("stalled interval must be positive".into()));
        }
        if let Some(limiter) = &self.limiter {
            limiter.validate()?;
        }
        Ok(())
    }
}

/// Something that happened inside one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was claimed
    Active { job_id: JobId },
    /// A job completed
    Completed {
        job_id: JobId,
        return_value: serde_json::Value,
    },
    /// A job failed; `will_retry` when it was scheduled for another attempt
    Failed {
        job_id: JobId,
        reason: String,
        will_retry: bool,
    },
    /// The processor reported progress
    Progress {
        job_id: JobId,
        progress: serde_json::Value,
    },
    /// The stalled sweep recovered a job
    Stalled { job_id: JobId },
    /// A queue operation failed
    Error { message: String },
    /// Nothing left to claim
    Drained,
    /// The worker was paused
    Paused,
    /// The worker was resumed
    Resumed,
    /// The worker started closing
    Closing,
    /// The worker stopped
    Closed,
}

/// A job handed to a processor, together with the lock that owns it.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    job: Job,
    token: String,
    queue: Queue,
    events: broadcast::Sender<WorkerEvent>,
}

impl Deref for ActiveJob {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl ActiveJob {
    /// The job as claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Lock token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Queue the job belongs to.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Record progress.
    pub async fn update_progress(&self, progress: serde_json::Value) -> QueueResult<()> {
        self.queue.update_progress(&self.job.id, progress.clone()).await?;
        let _ = self.events.send(WorkerEvent::Progress {
            job_id: self.job.id.clone(),
            progress,
        });
        Ok(())
    }

    /// Append a log line.
    pub async fn log(&self, line: impl Into<String>) -> QueueResult<usize> {
        self.queue.add_log(&self.job.id, line).await
    }

    /// Extend the lock by `duration` from now.
    pub async fn extend_lock(&self, duration: Duration) -> bool {
        self.queue.extend_lock(&self.job.id, &self.token, duration).await
    }

    /// Park the job until `timestamp` (ms). Return [`JobError::Delayed`]
    /// afterwards.
    pub async fn move_to_delayed(&self, timestamp: i64) -> QueueResult<()> {
        self.queue
            .move_to_delayed(&self.job.id, &self.token, timestamp)
            .await
    }

    /// Block the job on its pending children. When this returns `true`,
    /// return [`JobError::WaitingChildren`]; on `false` nothing is pending
    /// and the job can complete.
    pub async fn move_to_waiting_children(&self) -> QueueResult<bool> {
        self.queue
            .move_to_waiting_children(&self.job.id, &self.token, None)
            .await
    }

    /// Throttle the whole queue for `expire`. Return
    /// [`JobError::RateLimited`] afterwards to put this job back.
    pub async fn rate_limit(&self, expire: Duration) -> QueueResult<()> {
        self.queue.rate_limit(expire).await
    }

    /// Throttle one rate-limit group for `expire`, leaving other groups
    /// alone. Return [`JobError::RateLimited`] afterwards to put this job
    /// back; it is then held in delayed until the group's window reopens.
    pub async fn rate_limit_group(&self, group: &str, expire: Duration) -> QueueResult<()> {
        self.queue.rate_limit_group(group, expire).await
    }
}

struct Shared {
    queue: Queue,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    running: AtomicBool,
    paused: AtomicBool,
    drained: AtomicBool,
    closing: Mutex<CancellationToken>,
    resumed: Notify,
    idle: Notify,
    jobs: Mutex<HashMap<JobId, CancellationToken>>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report(&self, job_id: &str, err: QueueError) {
        match err {
            QueueError::MissingLock(_) | QueueError::LockMismatch(_) | QueueError::MissingKey(_) => {
                warn!(
                    queue = %self.queue.name(),
                    worker = %self.options.name,
                    job_id = %job_id,
                    error = %err,
                    "Job no longer owned, result dropped"
                );
            }
            err => {
                error!(
                    queue = %self.queue.name(),
                    worker = %self.options.name,
                    job_id = %job_id,
                    error = %err,
                    "Failed to finish job"
                );
                self.emit(WorkerEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Processes jobs from a queue.
pub struct Worker {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker. With `autorun` (the default) it starts polling
    /// immediately, which requires a Tokio runtime.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use conveyor_queue::*;
    /// use serde_json::json;
    ///
    /// # async fn example() -> QueueResult<()> {
    /// let queue = Queue::new(MemoryStore::new(), "emails")?;
    /// let worker = Worker::new(
    ///     queue,
    ///     |job: ActiveJob, _cancel| async move {
    ///         println!("Sending email: {:?}", job.data);
    ///         Ok(json!("sent"))
    ///     },
    ///     WorkerOptions::default().with_concurrency(4),
    /// )?;
    /// worker.close(false).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<F, Fut>(queue: Queue, handler: F, options: WorkerOptions) -> QueueResult<Self>
    where
        F: Fn(ActiveJob, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
    {
        Self::with_processor(queue, handler, options)
    }

    /// Create a worker around a [`Processor`] implementation.
    pub fn with_processor(
        queue: Queue,
        processor: impl Processor,
        options: WorkerOptions,
    ) -> QueueResult<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        let autorun = options.autorun;
        let worker = Self {
            shared: Arc::new(Shared {
                queue,
                processor: Arc::new(processor),
                options,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                closing: Mutex::new(CancellationToken::new()),
                resumed: Notify::new(),
                idle: Notify::new(),
                jobs: Mutex::new(HashMap::new()),
                events,
            }),
            handles: Mutex::new(Vec::new()),
        };
        if autorun {
            worker.run()?;
        }
        Ok(worker)
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    /// Queue the worker consumes.
    pub fn queue(&self) -> &Queue {
        &self.shared.queue
    }

    /// Options.
    pub fn options(&self) -> &WorkerOptions {
        &self.shared.options
    }

    /// Start the poll slots and the stalled sweep.
    pub fn run(&self) -> QueueResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        let closing = CancellationToken::new();
        *self.shared.closing.lock() = closing.clone();

        let options = &self.shared.options;
        info!(
            queue = %self.shared.queue.name(),
            worker = %options.name,
            concurrency = options.concurrency,
            "Worker starting"
        );

        let mut handles = self.handles.lock();
        for slot in 0..options.concurrency {
            handles.push(tokio::spawn(poll_loop(
                Arc::clone(&self.shared),
                slot,
                closing.clone(),
            )));
        }
        if !options.skip_stalled_check {
            handles.push(tokio::spawn(stalled_loop(Arc::clone(&self.shared), closing)));
        }
        Ok(())
    }

    /// Stop claiming and wait for the slots to finish. With `force`,
    /// in-flight processors are asked to stop through their cancellation
    /// token first.
    pub async fn close(&self, force: bool) -> QueueResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(QueueError::WorkerNotRunning);
        }
        info!(queue = %self.shared.queue.name(), worker = %self.name(), force, "Worker closing");
        self.shared.emit(WorkerEvent::Closing);
        self.shared.closing.lock().cancel();
        if force {
            self.cancel_all_jobs();
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(worker = %self.name(), error = %err, "Worker task ended abnormally");
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.emit(WorkerEvent::Closed);
        info!(queue = %self.shared.queue.name(), worker = %self.name(), "Worker closed");
        Ok(())
    }

    /// Stop claiming new jobs. With `wait`, return once the jobs in flight
    /// have finished.
    pub async fn pause(&self, wait: bool) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!(worker = %self.name(), "Worker paused");
            self.shared.emit(WorkerEvent::Paused);
        }
        if wait {
            loop {
                let idle = self.shared.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.shared.jobs.lock().is_empty() {
                    break;
                }
                idle.await;
            }
        }
    }

    /// Resume claiming.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            debug!(worker = %self.name(), "Worker resumed");
            self.shared.resumed.notify_waiters();
            self.shared.emit(WorkerEvent::Resumed);
        }
    }

    /// Whether the slots are running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the worker is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Ids of the jobs in flight.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.shared.jobs.lock().keys().cloned().collect()
    }

    /// Cancel the processor of one job in flight. Returns `false` when the
    /// job is not processed here.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.shared.jobs.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every processor in flight.
    pub fn cancel_all_jobs(&self) {
        for token in self.shared.jobs.lock().values() {
            token.cancel();
        }
    }

    /// Stream this worker's events from now on.
    pub fn subscribe(&self) -> impl Stream<Item = WorkerEvent> + Send + 'static {
        BroadcastStream::new(self.shared.events.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.closing.lock().cancel();
    }
}

async fn poll_loop(shared: Arc<Shared>, slot: usize, closing: CancellationToken) {
    let queue = shared.queue.clone();
    let notify = queue.notifier();
    debug!(queue = %queue.name(), worker = %shared.options.name, slot, "Poll slot started");

    while !closing.is_cancelled() {
        if shared.paused.load(Ordering::SeqCst) {
            let resumed = shared.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if shared.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = resumed => {}
                    _ = closing.cancelled() => break,
                }
            }
            continue;
        }

        // Armed before the claim so a job added in between is not missed.
        let woken = notify.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        let token = new_token();
        let outcome = queue
            .claim(
                &token,
                &shared.options.name,
                shared.options.lock_duration,
                shared.options.limiter.as_ref(),
            )
            .await;
        match outcome {
            Ok(ClaimOutcome::Job(job)) => {
                shared.drained.store(false, Ordering::SeqCst);
                process_job(&shared, *job, token).await;
            }
            Ok(ClaimOutcome::RateLimited { ttl_ms }) => {
                debug!(queue = %queue.name(), slot, ttl_ms, "Rate limited");
                let wait = Duration::from_millis(ttl_ms.max(1) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = closing.cancelled() => break,
                }
            }
            Ok(ClaimOutcome::NoJobsAvailable { next_due }) => {
                if !shared.drained.swap(true, Ordering::SeqCst) {
                    shared.emit(WorkerEvent::Drained);
                }
                let mut wait = shared.options.drain_delay;
                if let Some(due) = next_due {
                    let until = due.saturating_sub(queue.store().now_ms()).max(1) as u64;
                    wait = wait.min(Duration::from_millis(until));
                }
                tokio::select! {
                    _ = &mut woken => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = closing.cancelled() => break,
                }
            }
            Err(err) => {
                error!(queue = %queue.name(), slot, error = %err, "Failed to claim job");
                shared.emit(WorkerEvent::Error {
                    message: err.to_string(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = closing.cancelled() => break,
                }
            }
        }
    }
    debug!(queue = %queue.name(), worker = %shared.options.name, slot, "Poll slot stopped");
}

async fn process_job(shared: &Arc<Shared>, job: Job, token: String) {
    let job_id = job.id.clone();
    let cancel = CancellationToken::new();
    shared.jobs.lock().insert(job_id.clone(), cancel.clone());
    debug!(queue = %shared.queue.name(), job_id = %job_id, name = %job.name, "Processing job");
    shared.emit(WorkerEvent::Active {
        job_id: job_id.clone(),
    });

    let done = CancellationToken::new();
    let renewal = spawn_lock_renewal(
        shared.queue.clone(),
        job_id.clone(),
        token.clone(),
        shared.options.lock_duration,
        shared.options.renew_every(),
        cancel.clone(),
        done.clone(),
    );

    let active = ActiveJob {
        job,
        token: token.clone(),
        queue: shared.queue.clone(),
        events: shared.events.clone(),
    };
    let processor = Arc::clone(&shared.processor);
    let handler_cancel = cancel.clone();
    let result = match tokio::spawn(async move { processor.process(active, handler_cancel).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(JobError::Failed(panic_message(err.into_panic()))),
        Err(err) => Err(JobError::Failed(err.to_string())),
    };

    done.cancel();
    if let Err(err) = renewal.await {
        warn!(job_id = %job_id, error = %err, "Lock renewal task ended abnormally");
    }

    finish_job(shared, &job_id, &token, result).await;

    let mut jobs = shared.jobs.lock();
    jobs.remove(&job_id);
    if jobs.is_empty() {
        shared.idle.notify_waiters();
    }
}

async fn finish_job(
    shared: &Shared,
    job_id: &str,
    token: &str,
    result: Result<serde_json::Value, JobError>,
) {
    let queue = &shared.queue;
    let (reason, unrecoverable) = match result {
        Ok(value) => match queue.complete(job_id, token, value.clone()).await {
            Ok(_) => {
                debug!(queue = %queue.name(), job_id = %job_id, "Job completed");
                shared.emit(WorkerEvent::Completed {
                    job_id: job_id.to_string(),
                    return_value: value,
                });
                return;
            }
            Err(
                err @ (QueueError::MissingLock(_) | QueueError::LockMismatch(_) | QueueError::MissingKey(_)),
            ) => {
                shared.report(job_id, err);
                return;
            }
            Err(err) => (err.to_string(), false),
        },
        Err(JobError::RateLimited) => {
            if let Err(err) = queue.release_rate_limited(job_id, token).await {
                shared.report(job_id, err);
            }
            return;
        }
        Err(JobError::Delayed | JobError::WaitingChildren) => return,
        Err(JobError::Failed(reason)) => (reason, false),
        Err(JobError::Unrecoverable(reason)) => (reason, true),
    };

    match queue.fail(job_id, token, reason.clone(), unrecoverable).await {
        Ok(job) => {
            let will_retry = job.state != JobState::Failed;
            warn!(
                queue = %queue.name(),
                job_id = %job_id,
                attempts_made = job.attempts_made,
                will_retry,
                reason = %reason,
                "Job failed"
            );
            shared.emit(WorkerEvent::Failed {
                job_id: job_id.to_string(),
                reason,
                will_retry,
            });
        }
        Err(err) => shared.report(job_id, err),
    }
}

async fn stalled_loop(shared: Arc<Shared>, closing: CancellationToken) {
    let options = &shared.options;
    loop {
        match shared
            .queue
            .check_stalled(options.max_stalled_count, options.stalled_interval)
            .await
        {
            Ok(report) => {
                if !report.recovered.is_empty() || !report.failed.is_empty() {
                    info!(
                        queue = %shared.queue.name(),
                        recovered = report.recovered.len(),
                        failed = report.failed.len(),
                        "Stalled jobs handled"
                    );
                }
                for job_id in report.recovered {
                    shared.emit(WorkerEvent::Stalled { job_id });
                }
                for job_id in report.failed {
                    shared.emit(WorkerEvent::Failed {
                        job_id,
                        reason: crate::stalled::STALLED_FAILURE_REASON.to_string(),
                        will_retry: false,
                    });
                }
            }
            Err(err) => {
                error!(queue = %shared.queue.name(), error = %err, "Stalled check failed");
                shared.emit(WorkerEvent::Error {
                    message: err.to_string(),
                });
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(options.stalled_interval) => {}
            _ = closing.cancelled() => break,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("processor panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("processor panicked: {}", message)
    } else {
        "processor panicked".to_string()
    }
}
