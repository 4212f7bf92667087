//! Queue event log and subscriptions.
//!
//! Every transition appends typed events to the queue's bounded log inside
//! the same critical section as the transition itself. Observers read the
//! log as a stream that can start at any retained offset and then follows
//! live events.

use crate::job::{JobId, JobState};
use crate::store::MemoryStore;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Default number of events kept per queue.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// Position of an event in its queue's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Domain events emitted by the transition protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    /// A job record was created.
    Added { job_id: JobId, name: String },
    /// A job became ready.
    Waiting {
        job_id: JobId,
        prev: Option<JobState>,
    },
    /// A job was claimed.
    Active { job_id: JobId, prev: JobState },
    /// A job was delayed until `until` (ms).
    Delayed { job_id: JobId, until: i64 },
    /// A job completed.
    Completed {
        job_id: JobId,
        return_value: serde_json::Value,
    },
    /// A job failed terminally.
    Failed {
        job_id: JobId,
        failed_reason: String,
        prev: JobState,
    },
    /// A job used up its attempts.
    RetriesExhausted { job_id: JobId, attempts_made: u32 },
    /// A job was reclaimed from a dead worker.
    Stalled { job_id: JobId },
    /// A job was deleted.
    Removed { job_id: JobId, prev: JobState },
    /// An add was ignored because the id exists.
    Duplicated { job_id: JobId },
    /// An add was ignored because its deduplication id is live.
    Deduplicated {
        job_id: JobId,
        deduplication_id: String,
    },
    /// A handler reported progress.
    Progress {
        job_id: JobId,
        data: serde_json::Value,
    },
    /// A job is blocked on its children.
    WaitingChildren { job_id: JobId },
    /// A job's priority changed.
    Priority { job_id: JobId, priority: u32 },
    /// The queue was paused.
    Paused,
    /// The queue was resumed.
    Resumed,
    /// A claim found nothing to do.
    Drained,
    /// Jobs were cleaned.
    Cleaned { count: usize },
}

/// Event kinds, for filtering subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Added,
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    RetriesExhausted,
    Stalled,
    Removed,
    Duplicated,
    Deduplicated,
    Progress,
    WaitingChildren,
    Priority,
    Paused,
    Resumed,
    Drained,
    Cleaned,
}

impl QueueEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Added { .. } => EventKind::Added,
            QueueEvent::Waiting { .. } => EventKind::Waiting,
            QueueEvent::Active { .. } => EventKind::Active,
            QueueEvent::Delayed { .. } => EventKind::Delayed,
            QueueEvent::Completed { .. } => EventKind::Completed,
            QueueEvent::Failed { .. } => EventKind::Failed,
            QueueEvent::RetriesExhausted { .. } => EventKind::RetriesExhausted,
            QueueEvent::Stalled { .. } => EventKind::Stalled,
            QueueEvent::Removed { .. } => EventKind::Removed,
            QueueEvent::Duplicated { .. } => EventKind::Duplicated,
            QueueEvent::Deduplicated { .. } => EventKind::Deduplicated,
            QueueEvent::Progress { .. } => EventKind::Progress,
            QueueEvent::WaitingChildren { .. } => EventKind::WaitingChildren,
            QueueEvent::Priority { .. } => EventKind::Priority,
            QueueEvent::Paused => EventKind::Paused,
            QueueEvent::Resumed => EventKind::Resumed,
            QueueEvent::Drained => EventKind::Drained,
            QueueEvent::Cleaned { .. } => EventKind::Cleaned,
        }
    }

    /// Job the event is about, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Waiting { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::RetriesExhausted { job_id, .. }
            | QueueEvent::Stalled { job_id }
            | QueueEvent::Removed { job_id, .. }
            | QueueEvent::Duplicated { job_id }
            | QueueEvent::Deduplicated { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::WaitingChildren { job_id }
            | QueueEvent::Priority { job_id, .. } => Some(job_id),
            QueueEvent::Paused
            | QueueEvent::Resumed
            | QueueEvent::Drained
            | QueueEvent::Cleaned { .. } => None,
        }
    }
}

/// An event with its position and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Position in the queue's log
    pub id: EventId,
    /// Append time (ms)
    pub timestamp: i64,
    /// The event
    pub event: QueueEvent,
}

/// Bounded, append-only event log of one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    entries: VecDeque<StoredEvent>,
    next_id: u64,
    max_len: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            max_len: DEFAULT_MAX_EVENTS,
        }
    }
}

impl EventLog {
    pub(crate) fn append(&mut self, timestamp: i64, event: QueueEvent) -> StoredEvent {
        let stored = StoredEvent {
            id: EventId(self.next_id),
            timestamp,
            event,
        };
        self.next_id += 1;
        self.entries.push_back(stored.clone());
        self.trim();
        stored
    }

    /// Keep at most `max_len` events from now on.
    pub(crate) fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.max_len {
            self.entries.pop_front();
        }
    }

    /// Events strictly after `after` (or all retained events).
    pub fn since(&self, after: Option<EventId>) -> Vec<StoredEvent> {
        self.entries
            .iter()
            .filter(|e| after.is_none_or(|a| e.id > a))
            .cloned()
            .collect()
    }

    /// Id of the newest event.
    pub fn last_id(&self) -> Option<EventId> {
        self.entries.back().map(|e| e.id)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOffset {
    /// Replay every retained event first.
    Beginning,
    /// Only events appended after subscribing.
    #[default]
    Latest,
    /// Replay events after this id.
    After(EventId),
}

/// Observer of one queue's event log.
#[derive(Clone)]
pub struct QueueEvents {
    store: MemoryStore,
    queue: String,
}

impl QueueEvents {
    /// Observe `queue` in `store`.
    pub fn new(store: MemoryStore, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Id of the newest retained event.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.store
            .read(|ks| ks.queue(&self.queue).and_then(|q| q.events.last_id()))
    }

    /// Stream events from `offset` on.
    ///
    /// The backlog and the live feed are captured in one critical section,
    /// so no event is skipped or repeated at the seam. A subscriber that
    /// falls behind the live buffer loses the overflowed events and is told
    /// so through a warning log.
    pub fn subscribe(&self, offset: EventOffset) -> impl Stream<Item = StoredEvent> + Send + 'static {
        let (backlog, receiver) = self.store.subscribe_events(&self.queue, offset);
        let queue = self.queue.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let queue = queue.clone();
            async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(queue = %queue, skipped, "Event subscriber lagged");
                        None
                    }
                }
            }
        });
        stream::iter(backlog).chain(live)
    }

    /// Stream events of one kind from `offset` on.
    pub fn subscribe_kind(
        &self,
        kind: EventKind,
        offset: EventOffset,
    ) -> impl Stream<Item = StoredEvent> + Send + 'static {
        self.subscribe(offset)
            .filter(move |e| futures::future::ready(e.event.kind() == kind))
    }
}
