//! Typed keyspace: the data layout every component reads and writes.
//!
//! Each queue owns its job records and one container per state set. A job
//! id is a member of exactly one container and its record's `state` names
//! that container; the `attach_*`/`detach` pairs below are the only code that
//! touches the containers.

use crate::events::{EventLog, QueueEvent, StoredEvent};
use crate::flow::DependencyRecord;
use crate::job::{Job, JobId, JobState};
use crate::limiter::{RateLimitWindow, RateLimiterOptions};
use crate::lock::LockEntry;
use crate::repeat::JobScheduler;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Sort key of a scored set: primary score, then insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Score {
    /// Priority, due time or finish time
    pub primary: i64,
    /// Insertion sequence, breaks ties first-in first-out
    pub seq: u64,
}

/// Set of job ids ordered by [`Score`].
#[derive(Debug, Clone, Default)]
pub struct ScoredSet {
    by_score: BTreeMap<Score, JobId>,
    scores: HashMap<JobId, Score>,
}

impl ScoredSet {
    /// Insert or re-score a member.
    pub fn insert(&mut self, id: JobId, score: Score) {
        if let Some(old) = self.scores.insert(id.clone(), score) {
            self.by_score.remove(&old);
        }
        self.by_score.insert(score, id);
    }

    /// Remove a member.
    pub fn remove(&mut self, id: &str) -> Option<Score> {
        let score = self.scores.remove(id)?;
        self.by_score.remove(&score);
        Some(score)
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: &str) -> bool {
        self.scores.contains_key(id)
    }

    /// Score of a member.
    pub fn score(&self, id: &str) -> Option<Score> {
        self.scores.get(id).copied()
    }

    /// Lowest member.
    pub fn first(&self) -> Option<(Score, &JobId)> {
        self.by_score.iter().next().map(|(s, id)| (*s, id))
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Score, &JobId)> {
        self.by_score.iter().map(|(s, id)| (*s, id))
    }

    /// Members whose primary score is at most `max`, ascending.
    pub fn up_to(&self, max: i64) -> Vec<JobId> {
        self.by_score
            .iter()
            .take_while(|(s, _)| s.primary <= max)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl Serialize for ScoredSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.by_score.iter().map(|(s, id)| (id, s)))
    }
}

impl<'de> Deserialize<'de> for ScoredSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let members: Vec<(JobId, Score)> = Vec::deserialize(deserializer)?;
        let mut set = ScoredSet::default();
        for (id, score) in members {
            set.insert(id, score);
        }
        Ok(set)
    }
}

/// Queue-wide flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMeta {
    /// Queue is paused
    pub paused: bool,
    /// Maximum active jobs across all workers
    pub concurrency: Option<usize>,
    /// Limiter overriding the workers' limiters
    pub limiter: Option<RateLimiterOptions>,
    /// A `drained` event was emitted and nothing became ready since
    pub drained: bool,
}

/// Live deduplication entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// Job that owns the id
    pub job_id: JobId,
    /// Expiry (ms); `None` lives until the job finishes
    pub expires_at: Option<i64>,
}

/// Everything stored for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueKeyspace {
    pub(crate) name: String,
    pub(crate) id_counter: u64,
    seq: u64,
    pub(crate) jobs: HashMap<JobId, Job>,
    pub(crate) logs: HashMap<JobId, VecDeque<String>>,
    pub(crate) wait: VecDeque<JobId>,
    pub(crate) paused: VecDeque<JobId>,
    pub(crate) prioritized: ScoredSet,
    pub(crate) delayed: ScoredSet,
    pub(crate) active: VecDeque<JobId>,
    pub(crate) completed: ScoredSet,
    pub(crate) failed: ScoredSet,
    pub(crate) waiting_children: ScoredSet,
    pub(crate) locks: HashMap<JobId, LockEntry>,
    pub(crate) stalled: BTreeSet<JobId>,
    pub(crate) stalled_gate: Option<i64>,
    pub(crate) dependencies: HashMap<JobId, DependencyRecord>,
    pub(crate) limiter: Option<RateLimitWindow>,
    pub(crate) group_limiters: HashMap<String, RateLimitWindow>,
    pub(crate) schedulers: BTreeMap<String, JobScheduler>,
    pub(crate) dedup: HashMap<String, DedupEntry>,
    pub(crate) meta: QueueMeta,
    pub(crate) events: EventLog,
    #[serde(skip)]
    outbox: Vec<StoredEvent>,
}

impl QueueKeyspace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Job record.
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// State of a job, if it exists.
    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.jobs.get(id).map(|j| j.state)
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.meta.paused
    }

    /// Retained event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Next free counter id and the counter value that produces it. The
    /// counter is only advanced once the add succeeds.
    pub(crate) fn peek_job_id(&self) -> (JobId, u64) {
        let mut counter = self.id_counter;
        loop {
            counter += 1;
            let id = counter.to_string();
            if !self.jobs.contains_key(&id) {
                return (id, counter);
            }
        }
    }

    /// Append an event to the log and to the publication outbox.
    pub(crate) fn emit(&mut self, now: i64, event: QueueEvent) {
        let stored = self.events.append(now, event);
        self.outbox.push(stored);
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<StoredEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Remove `id` from the container its state names.
    pub(crate) fn detach(&mut self, id: &str) -> Option<JobState> {
        let state = self.jobs.get(id)?.state;
        match state {
            JobState::Waiting => remove_from_list(&mut self.wait, id),
            JobState::Paused => remove_from_list(&mut self.paused, id),
            JobState::Active => remove_from_list(&mut self.active, id),
            JobState::Prioritized => {
                self.prioritized.remove(id);
            }
            JobState::Delayed => {
                self.delayed.remove(id);
            }
            JobState::Completed => {
                self.completed.remove(id);
            }
            JobState::Failed => {
                self.failed.remove(id);
            }
            JobState::WaitingChildren => {
                self.waiting_children.remove(id);
            }
        }
        Some(state)
    }

    fn set_state(&mut self, id: &str, state: JobState) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.state = state;
        }
    }

    /// Make a detached job ready: prioritized when it has a priority, else
    /// the wait list (or the paused list while paused). `front` puts it at
    /// the claiming end.
    pub(crate) fn attach_ready(&mut self, id: &str, front: bool) -> JobState {
        let priority = self.jobs.get(id).map(|j| j.priority).unwrap_or(0);
        let state = if priority > 0 {
            let seq = self.next_seq();
            self.prioritized.insert(
                id.to_string(),
                Score {
                    primary: i64::from(priority),
                    seq,
                },
            );
            JobState::Prioritized
        } else {
            let paused = self.meta.paused;
            let list = if paused { &mut self.paused } else { &mut self.wait };
            if front {
                list.push_front(id.to_string());
            } else {
                list.push_back(id.to_string());
            }
            if paused {
                JobState::Paused
            } else {
                JobState::Waiting
            }
        };
        self.set_state(id, state);
        self.meta.drained = false;
        state
    }

    pub(crate) fn attach_delayed(&mut self, id: &str, due: i64) {
        let seq = self.next_seq();
        self.delayed.insert(id.to_string(), Score { primary: due, seq });
        self.set_state(id, JobState::Delayed);
    }

    pub(crate) fn attach_active(&mut self, id: &str) {
        self.active.push_back(id.to_string());
        self.set_state(id, JobState::Active);
    }

    pub(crate) fn attach_waiting_children(&mut self, id: &str) {
        let seq = self.next_seq();
        self.waiting_children
            .insert(id.to_string(), Score { primary: 0, seq });
        self.set_state(id, JobState::WaitingChildren);
    }

    pub(crate) fn attach_finished(&mut self, id: &str, state: JobState, finished_on: i64) {
        let seq = self.next_seq();
        let score = Score {
            primary: finished_on,
            seq,
        };
        match state {
            JobState::Completed => self.completed.insert(id.to_string(), score),
            _ => self.failed.insert(id.to_string(), score),
        }
        self.set_state(id, state);
    }

    /// Detach and make ready, emitting `waiting`.
    pub(crate) fn move_to_ready(&mut self, now: i64, id: &str, front: bool) -> JobState {
        let prev = self.detach(id);
        let state = self.attach_ready(id, front);
        self.emit(
            now,
            QueueEvent::Waiting {
                job_id: id.to_string(),
                prev,
            },
        );
        state
    }

    /// Detach and delay until `due`, emitting `delayed`.
    pub(crate) fn move_to_delayed(&mut self, now: i64, id: &str, due: i64) {
        self.detach(id);
        self.attach_delayed(id, due);
        self.emit(
            now,
            QueueEvent::Delayed {
                job_id: id.to_string(),
                until: due,
            },
        );
    }

    /// Promote every delayed job due at `now`.
    pub(crate) fn promote_due(&mut self, now: i64) -> usize {
        let due = self.delayed.up_to(now);
        for id in &due {
            if let Some(job) = self.jobs.get_mut(id) {
                job.delay_ms = 0;
            }
            self.move_to_ready(now, id, false);
        }
        due.len()
    }

    /// Delete a record and everything keyed by its id in this queue.
    /// Parent bookkeeping is the caller's business.
    pub(crate) fn delete_record(&mut self, id: &str) -> Option<Job> {
        self.detach(id);
        let job = self.jobs.remove(id)?;
        self.logs.remove(id);
        self.dependencies.remove(id);
        self.locks.remove(id);
        self.stalled.remove(id);
        if let Some(dedup_id) = &job.deduplication_id {
            if self.dedup.get(dedup_id).is_some_and(|e| e.job_id == id) {
                self.dedup.remove(dedup_id);
            }
        }
        if let Some(key) = &job.repeat_job_key {
            if let Some(scheduler) = self.schedulers.get_mut(key) {
                if scheduler.pending_job_id.as_deref() == Some(id) {
                    scheduler.pending_job_id = None;
                }
            }
        }
        Some(job)
    }

    /// Number of jobs in a state.
    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.wait.len(),
            JobState::Paused => self.paused.len(),
            JobState::Prioritized => self.prioritized.len(),
            JobState::Delayed => self.delayed.len(),
            JobState::Active => self.active.len(),
            JobState::Completed => self.completed.len(),
            JobState::Failed => self.failed.len(),
            JobState::WaitingChildren => self.waiting_children.len(),
        }
    }

    /// Ids in a state, in claim/score order.
    pub fn ids(&self, state: JobState) -> Vec<JobId> {
        match state {
            JobState::Waiting => self.wait.iter().cloned().collect(),
            JobState::Paused => self.paused.iter().cloned().collect(),
            JobState::Active => self.active.iter().cloned().collect(),
            JobState::Prioritized => scored_ids(&self.prioritized),
            JobState::Delayed => scored_ids(&self.delayed),
            JobState::Completed => scored_ids(&self.completed),
            JobState::Failed => scored_ids(&self.failed),
            JobState::WaitingChildren => scored_ids(&self.waiting_children),
        }
    }

    /// Verify that every job sits in exactly the container its state names.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut seen: HashMap<&str, JobState> = HashMap::new();
        for state in JobState::ALL {
            let ids = self.ids(state);
            for id in ids {
                let Some(job) = self.jobs.get(&id) else {
                    return Err(format!("{} in {} has no record", id, state));
                };
                if job.state != state {
                    return Err(format!("{} in {} but state is {}", id, state, job.state));
                }
                if let Some(other) = seen.insert(job.id.as_str(), state) {
                    return Err(format!("{} in both {} and {}", id, other, state));
                }
            }
        }
        if seen.len() != self.jobs.len() {
            return Err(format!(
                "{} records but {} set members",
                self.jobs.len(),
                seen.len()
            ));
        }
        Ok(())
    }
}

fn remove_from_list(list: &mut VecDeque<JobId>, id: &str) {
    if let Some(pos) = list.iter().position(|x| x == id) {
        list.remove(pos);
    }
}

fn scored_ids(set: &ScoredSet) -> Vec<JobId> {
    set.iter().map(|(_, id)| id.clone()).collect()
}

/// All queues of one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keyspace {
    queues: BTreeMap<String, QueueKeyspace>,
}

impl Keyspace {
    /// Read a queue.
    pub fn queue(&self, name: &str) -> Option<&QueueKeyspace> {
        self.queues.get(name)
    }

    /// Get a queue, creating it on first use.
    pub(crate) fn queue_mut(&mut self, name: &str) -> &mut QueueKeyspace {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| QueueKeyspace::new(name))
    }

    /// Get a queue only if it exists.
    pub(crate) fn existing_queue_mut(&mut self, name: &str) -> Option<&mut QueueKeyspace> {
        self.queues.get_mut(name)
    }

    /// Read a job.
    pub fn job(&self, queue: &str, id: &str) -> Option<&Job> {
        self.queues.get(queue)?.jobs.get(id)
    }

    /// Names of all queues.
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub(crate) fn drain_outboxes(&mut self) -> Vec<(String, Vec<StoredEvent>)> {
        self.queues
            .iter_mut()
            .filter_map(|(name, q)| {
                let events = q.take_outbox();
                (!events.is_empty()).then(|| (name.clone(), events))
            })
            .collect()
    }

    pub(crate) fn discard_outboxes(&mut self) {
        for q in self.queues.values_mut() {
            q.take_outbox();
        }
    }
}
