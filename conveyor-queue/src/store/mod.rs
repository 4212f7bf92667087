//! Single-writer keyspace store.
//!
//! Every protocol operation is a closure run against the keyspace under one
//! lock, so each transition is atomic with respect to every other one.
//! Events appended during a transaction are published to subscribers and
//! the queue's wakeup notifier only after the closure returned `Ok`.

mod keyspace;

pub use keyspace::{DedupEntry, Keyspace, QueueKeyspace, QueueMeta, Score, ScoredSet};

use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventOffset, StoredEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

/// Capacity of each queue's live event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

struct State {
    keyspace: Keyspace,
    channels: HashMap<String, broadcast::Sender<StoredEvent>>,
    notifiers: HashMap<String, Arc<Notify>>,
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

/// Shared handle to one keyspace. Cloning is cheap and every clone sees the
/// same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

/// Serialized copy of a keyspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: u32,
    /// Time the snapshot was taken (ms)
    pub taken_at: i64,
    /// Keyspace contents
    pub keyspace: Keyspace,
}

impl MemoryStore {
    /// Create an empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self::from_parts(Keyspace::default(), Arc::new(clock))
    }

    fn from_parts(keyspace: Keyspace, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    keyspace,
                    channels: HashMap::new(),
                    notifiers: HashMap::new(),
                }),
                clock,
            }),
        }
    }

    /// The store's clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Current time on the store's clock (ms).
    pub fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Run `f` as one atomic transition.
    ///
    /// `f` receives the keyspace and the transaction time. It must validate
    /// before it mutates: an `Err` discards pending events but does not roll
    /// back keyspace changes.
    pub(crate) fn transact<R>(
        &self,
        f: impl FnOnce(&mut Keyspace, i64) -> QueueResult<R>,
    ) -> QueueResult<R> {
        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now_ms();
        match f(&mut state.keyspace, now) {
            Ok(value) => {
                let published = state.keyspace.drain_outboxes();
                for (queue, events) in published {
                    if let Some(sender) = state.channels.get(&queue) {
                        for event in events {
                            // No receivers is fine.
                            let _ = sender.send(event);
                        }
                    }
                    if let Some(notify) = state.notifiers.get(&queue) {
                        notify.notify_waiters();
                    }
                }
                Ok(value)
            }
            Err(err) => {
                state.keyspace.discard_outboxes();
                Err(err)
            }
        }
    }

    /// Read the keyspace.
    pub fn read<R>(&self, f: impl FnOnce(&Keyspace) -> R) -> R {
        let state = self.inner.state.lock();
        f(&state.keyspace)
    }

    /// Wakeup handle notified whenever a transaction emits events for `queue`.
    pub(crate) fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut state = self.inner.state.lock();
        Arc::clone(
            state
                .notifiers
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Capture the retained backlog after `offset` and a live receiver in
    /// the same critical section.
    pub(crate) fn subscribe_events(
        &self,
        queue: &str,
        offset: EventOffset,
    ) -> (Vec<StoredEvent>, broadcast::Receiver<StoredEvent>) {
        let mut state = self.inner.state.lock();
        let receiver = state
            .channels
            .entry(queue.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe();
        let backlog = match (offset, state.keyspace.queue(queue)) {
            (EventOffset::Latest, _) | (_, None) => Vec::new(),
            (EventOffset::Beginning, Some(q)) => q.events().since(None),
            (EventOffset::After(id), Some(q)) => q.events().since(Some(id)),
        };
        (backlog, receiver)
    }

    /// Copy the whole keyspace.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        Snapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.inner.clock.now_ms(),
            keyspace: state.keyspace.clone(),
        }
    }

    /// Replace the keyspace with a snapshot. Subscribers stay attached.
    pub fn restore(&self, snapshot: Snapshot) -> QueueResult<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(QueueError::Deserialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let mut state = self.inner.state.lock();
        state.keyspace = snapshot.keyspace;
        for notify in state.notifiers.values() {
            notify.notify_waiters();
        }
        debug!(taken_at = snapshot.taken_at, "Keyspace restored");
        Ok(())
    }

    /// Write a JSON snapshot to `path`.
    pub async fn persist(&self, path: impl AsRef<Path>) -> QueueResult<()> {
        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let path = path.as_ref();
        tokio::fs::write(path, bytes).await?;
        info!(path = %path.display(), "Keyspace persisted");
        Ok(())
    }

    /// Load a store from a JSON snapshot on the wall clock.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        Self::open_with_clock(path, SystemClock).await
    }

    /// Load a store from a JSON snapshot.
    pub async fn open_with_clock(
        path: impl AsRef<Path>,
        clock: impl Clock + 'static,
    ) -> QueueResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| QueueError::Deserialization(e.to_string()))?;
        let store = Self::with_clock(clock);
        store.restore(snapshot)?;
        info!(path = %path.display(), "Keyspace loaded");
        Ok(store)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}
