//! Persistent job queue with atomic transitions.
//!
//! Provides a job lifecycle engine with:
//! - 📦 Snapshot-backed persistence of every queue in a store
//! - 🔒 Token locks with renewal and stalled-job recovery
//! - 🔄 Retries with fixed, exponential or custom backoff
//! - ⭐ Priorities, LIFO and delayed jobs
//! - 🚦 Queue-wide and per-group rate limiting
//! - ⏰ Cron and interval job schedulers
//! - 🌳 Parent/child flows across queues
//! - 📜 A bounded, replayable event log per queue
//! - 👷 Workers with concurrency, pause and graceful close
//!
//! ## Quick Start
//!
//! ```
//! use conveyor_queue::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let queue = Queue::new(MemoryStore::new(), "emails")?;
//! let job = queue
//!     .add_with_options(
//!         "send_welcome",
//!         json!({"to": "user@example.com"}),
//!         JobOptions::new().with_priority(1).with_attempts(3),
//!     )
//!     .await?;
//!
//! assert_eq!(job.queue, "emails");
//! assert_eq!(queue.get_state(&job.id).await, Some(JobState::Prioritized));
//! # Ok(())
//! # }
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use conveyor_queue::QueueConfig;
//!
//! let config = QueueConfig::new("emails")
//!     .with_max_size(10000)
//!     .with_max_events(500);
//!
//! assert_eq!(config.queue_name, "emails");
//! assert_eq!(config.max_size, 10000);
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Processing Jobs
//!
//! ```no_run
//! use conveyor_queue::*;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let store = MemoryStore::open("queues.json").await?;
//!     let queue = Queue::new(store.clone(), "default")?;
//!
//!     queue.add("send_email", json!({"to": "user@example.com"})).await?;
//!
//!     let worker = Worker::new(
//!         queue,
//!         |job: ActiveJob, _cancel| async move {
//!             job.log("sending").await?;
//!             Ok(json!({"sent": true}))
//!         },
//!         WorkerOptions::default()
//!             .with_concurrency(4)
//!             .with_limiter(RateLimiterOptions::new(10, Duration::from_secs(1))),
//!     )?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     worker.close(false).await?;
//!     store.persist("queues.json").await?;
//!     Ok(())
//! }
//! ```

mod admin;
pub mod backoff;
pub mod clock;
pub mod error;
pub mod events;
pub mod flow;
pub mod job;
pub mod keys;
pub mod limiter;
pub mod lock;
pub mod protocol;
pub mod queue;
pub mod repeat;
pub mod stalled;
pub mod store;
pub mod worker;

pub use backoff::BackoffStrategy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, QueueError, QueueResult};
pub use events::{EventId, EventKind, EventOffset, QueueEvent, QueueEvents, StoredEvent};
pub use flow::{
    Dependencies, DependencyCounts, DependencyQuery, FlowJob, FlowProducer, JobNode, Page, PageRequest,
};
pub use job::{
    Backoff, Job, JobData, JobId, JobOptions, JobState, KeepJobs, ParentFailurePolicy, ParentRef,
};
pub use limiter::RateLimiterOptions;
pub use protocol::ClaimOutcome;
pub use queue::{BulkJob, Queue, QueueConfig, QueueSettings};
pub use repeat::{JobScheduler, JobTemplate, RepeatOptions, RepeatStrategy};
pub use stalled::StalledReport;
pub use store::{MemoryStore, Snapshot};
pub use worker::{ActiveJob, Processor, Worker, WorkerEvent, WorkerOptions};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{JobError, QueueError, QueueResult};
    pub use crate::events::{EventOffset, QueueEvent, QueueEvents};
    pub use crate::flow::{FlowJob, FlowProducer};
    pub use crate::job::{Backoff, Job, JobData, JobId, JobOptions, JobState, KeepJobs, ParentRef};
    pub use crate::limiter::RateLimiterOptions;
    pub use crate::queue::{Queue, QueueConfig};
    pub use crate::repeat::{JobTemplate, RepeatOptions};
    pub use crate::store::MemoryStore;
    pub use crate::worker::{ActiveJob, Worker, WorkerEvent, WorkerOptions};
}
