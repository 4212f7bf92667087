//! Parent/child flows.
//!
//! A parent keeps a dependency record listing the keys of its unfinished
//! children. Finishing or removing a child resolves its key exactly once;
//! when the last pending key resolves and the parent is waiting on its
//! children, the parent becomes ready (or delayed) in the same transaction.

use crate::clock;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobOptions, JobState, ParentRef};
use crate::keys;
use crate::protocol;
use crate::queue::QueueConfig;
use crate::store::{Keyspace, MemoryStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use tracing::debug;

/// Default page size for dependency listings.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Children of one parent, by resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Unfinished children
    pub pending: BTreeSet<String>,
    /// Completed children and their return values
    pub processed: BTreeMap<String, serde_json::Value>,
    /// Failed children whose failure was ignored, with the reason
    pub failed: BTreeMap<String, String>,
}

impl DependencyRecord {
    /// Every child key the record knows about.
    pub fn child_keys(&self) -> impl Iterator<Item = &String> {
        self.pending
            .iter()
            .chain(self.processed.keys())
            .chain(self.failed.keys())
    }
}

/// How a child left the pending set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    Processed(serde_json::Value),
    Failed(String),
    Removed,
}

/// Resolve `child_key` on its parent. A key that is no longer pending is
/// ignored.
pub(crate) fn resolve_child(
    ks: &mut Keyspace,
    now: i64,
    parent: &ParentRef,
    child_key: &str,
    resolution: Resolution,
) {
    let Some(pq) = ks.existing_queue_mut(&parent.queue) else {
        return;
    };
    let Some(deps) = pq.dependencies.get_mut(&parent.id) else {
        return;
    };
    if !deps.pending.remove(child_key) {
        return;
    }
    match resolution {
        Resolution::Processed(value) => {
            deps.processed.insert(child_key.to_string(), value);
        }
        Resolution::Failed(reason) => {
            deps.failed.insert(child_key.to_string(), reason);
        }
        Resolution::Removed => {}
    }
    release_if_resolved(ks, now, parent);
}

/// Move a parent out of waiting-children once nothing is pending.
pub(crate) fn release_if_resolved(ks: &mut Keyspace, now: i64, parent: &ParentRef) {
    let Some(pq) = ks.existing_queue_mut(&parent.queue) else {
        return;
    };
    if pq.state_of(&parent.id) != Some(JobState::WaitingChildren) {
        return;
    }
    let pending = pq
        .dependencies
        .get(&parent.id)
        .is_some_and(|d| !d.pending.is_empty());
    if pending {
        return;
    }
    let delay = pq.job(&parent.id).map(|j| j.delay_ms).unwrap_or(0);
    if delay > 0 {
        pq.move_to_delayed(now, &parent.id, clock::after(now, delay));
    } else {
        pq.move_to_ready(now, &parent.id, false);
    }
    debug!(queue = %parent.queue, job_id = %parent.id, "Parent released");
}

/// Fail a parent blocked on `child_key`. A parent that is not waiting on
/// its children keeps the key pending and can therefore not complete.
pub(crate) fn fail_parent(
    ks: &mut Keyspace,
    now: i64,
    config: &QueueConfig,
    parent: &ParentRef,
    child_key: &str,
    reason: &str,
) {
    let Some(pq) = ks.existing_queue_mut(&parent.queue) else {
        return;
    };
    if pq.state_of(&parent.id) != Some(JobState::WaitingChildren) {
        return;
    }
    if let Some(deps) = pq.dependencies.get_mut(&parent.id) {
        if deps.pending.remove(child_key) {
            deps.failed.insert(child_key.to_string(), reason.to_string());
        }
    }
    let parent_reason = format!("child {} failed", child_key);
    protocol::finish_failed(ks, now, config, &parent.queue, &parent.id, &parent_reason);
}

/// Re-attach a duplicated child to the parent it was added under: a
/// completed child counts as processed, an unfinished child of the same
/// parent is pending again.
pub(crate) fn relink_duplicate(ks: &mut Keyspace, parent: &ParentRef, existing: &Job) {
    let key = existing.key();
    let same_parent = existing.parent.as_ref() == Some(parent);
    let Some(pq) = ks.existing_queue_mut(&parent.queue) else {
        return;
    };
    if pq.job(&parent.id).is_none_or(|p| p.is_finished()) {
        return;
    }
    let deps = pq.dependencies.entry(parent.id.clone()).or_default();
    if existing.state == JobState::Completed {
        if !deps.processed.contains_key(&key) {
            deps.pending.remove(&key);
            deps.processed.insert(
                key,
                existing.return_value.clone().unwrap_or(serde_json::Value::Null),
            );
        }
    } else if same_parent && !existing.is_finished() {
        deps.pending.insert(key);
    }
}

/// Append every descendant of `queue:id` to `out`, parents before children.
pub(crate) fn collect_descendants(
    ks: &Keyspace,
    queue: &str,
    id: &str,
    out: &mut Vec<(String, String)>,
) {
    let mut seen: HashSet<String> = out.iter().map(|(q, id)| keys::job_key(q, id)).collect();
    let mut frontier = vec![(queue.to_string(), id.to_string())];
    while let Some((q, id)) = frontier.pop() {
        let Some(deps) = ks.queue(&q).and_then(|qk| qk.dependencies.get(&id)) else {
            continue;
        };
        for key in deps.child_keys() {
            let Some((cq, cid)) = keys::parse_job_key(key) else {
                continue;
            };
            if ks.job(cq, cid).is_none() || !seen.insert(key.clone()) {
                continue;
            }
            out.push((cq.to_string(), cid.to_string()));
            frontier.push((cq.to_string(), cid.to_string()));
        }
    }
}

/// One node of a flow to add.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowJob {
    /// Job name
    pub name: String,
    /// Queue the job is added to
    pub queue_name: String,
    /// Job data
    pub data: JobData,
    /// Options; `None` uses the queue's default options
    pub opts: Option<JobOptions>,
    /// Children, which must finish before this job runs
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    /// A flow node without children.
    pub fn new(name: impl Into<String>, queue_name: impl Into<String>, data: JobData) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            data,
            opts: None,
            children: Vec::new(),
        }
    }

    /// Set the job options.
    pub fn with_options(mut self, opts: JobOptions) -> Self {
        self.opts = Some(opts);
        self
    }

    /// Add a child.
    pub fn with_child(mut self, child: FlowJob) -> Self {
        self.children.push(child);
        self
    }

    /// Add several children.
    pub fn with_children(mut self, children: impl IntoIterator<Item = FlowJob>) -> Self {
        self.children.extend(children);
        self
    }
}

/// A job and its children as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNode {
    /// The job
    pub job: Job,
    /// Its children
    pub children: Vec<JobNode>,
}

/// Adds whole job trees atomically.
#[derive(Clone)]
pub struct FlowProducer {
    store: MemoryStore,
    configs: HashMap<String, QueueConfig>,
}

impl FlowProducer {
    /// Create a producer writing to `store`.
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            configs: HashMap::new(),
        }
    }

    /// Use `config` (size limit, default options, strategies) for jobs
    /// added to its queue.
    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.configs.insert(config.queue_name.clone(), config);
        self
    }

    /// Add a tree: the parent in waiting-children, then its children.
    pub async fn add(&self, flow: FlowJob) -> QueueResult<JobNode> {
        let mut nodes = self.add_bulk(vec![flow]).await?;
        nodes
            .pop()
            .ok_or_else(|| QueueError::Config("empty flow".into()))
    }

    /// Add several trees in one transaction.
    pub async fn add_bulk(&self, flows: Vec<FlowJob>) -> QueueResult<Vec<JobNode>> {
        self.store.transact(|ks, now| {
            let mut additions: HashMap<String, usize> = HashMap::new();
            for flow in &flows {
                let parent = flow.opts.as_ref().and_then(|o| o.parent.clone());
                self.validate(ks, flow, parent.as_ref(), &mut additions)?;
            }
            for (queue, added) in &additions {
                let config = self.config(queue);
                let pending = ks.queue(queue).map(pending_jobs).unwrap_or(0);
                if config.max_size > 0 && pending + added > config.max_size {
                    return Err(QueueError::QueueFull);
                }
            }
            flows
                .into_iter()
                .map(|flow| {
                    let parent = flow.opts.as_ref().and_then(|o| o.parent.clone());
                    self.insert(ks, now, flow, parent)
                })
                .collect()
        })
    }

    fn config(&self, queue: &str) -> QueueConfig {
        self.configs
            .get(queue)
            .cloned()
            .unwrap_or_else(|| QueueConfig::new(queue))
    }

    fn options(&self, node: &FlowJob) -> JobOptions {
        node.opts
            .clone()
            .unwrap_or_else(|| self.config(&node.queue_name).default_job_options)
    }

    /// Check everything that could make an insert fail.
    fn validate(
        &self,
        ks: &Keyspace,
        node: &FlowJob,
        parent: Option<&ParentRef>,
        additions: &mut HashMap<String, usize>,
    ) -> QueueResult<()> {
        if node.queue_name.is_empty() {
            return Err(QueueError::Config("flow job without a queue name".into()));
        }
        let opts = self.options(node);
        let existing = match &opts.job_id {
            Some(id) => {
                keys::validate_job_id(id)?;
                ks.job(&node.queue_name, id)
            }
            None => None,
        };
        match existing {
            Some(job) if !node.children.is_empty() && job.is_finished() => {
                return Err(QueueError::not_in_state(job.id.clone(), "unfinished", job.state));
            }
            Some(_) => {}
            None => *additions.entry(node.queue_name.clone()).or_default() += 1,
        }
        if let Some(parent) = parent {
            // Parents created by this flow are checked when they are added.
            if let Some(parent_job) = ks.job(&parent.queue, &parent.id) {
                if parent_job.is_finished() {
                    return Err(QueueError::not_in_state(
                        parent.id.clone(),
                        "unfinished",
                        parent_job.state,
                    ));
                }
            } else if node.opts.as_ref().and_then(|o| o.parent.as_ref()) == Some(parent) {
                return Err(QueueError::MissingParent(parent.key()));
            }
        }
        for child in &node.children {
            let child_parent = match &opts.job_id {
                Some(id) => Some(ParentRef::new(node.queue_name.clone(), id.clone())),
                None => None,
            };
            self.validate(ks, child, child_parent.as_ref(), additions)?;
        }
        Ok(())
    }

    fn insert(
        &self,
        ks: &mut Keyspace,
        now: i64,
        node: FlowJob,
        parent: Option<ParentRef>,
    ) -> QueueResult<JobNode> {
        let config = self.config(&node.queue_name);
        let mut opts = self.options(&node);
        opts.parent = parent;
        let has_children = !node.children.is_empty();
        let job = protocol::add_job(ks, now, &config, node.name, node.data, opts, has_children)?;
        let me = ParentRef::new(job.queue.clone(), job.id.clone());

        let children = node
            .children
            .into_iter()
            .map(|child| self.insert(ks, now, child, Some(me.clone())))
            .collect::<QueueResult<Vec<_>>>()?;
        if has_children {
            release_if_resolved(ks, now, &me);
        }
        let job = ks.job(&me.queue, &me.id).cloned().unwrap_or(job);
        Ok(JobNode { job, children })
    }

    /// Rebuild the tree under `queue:id`, `depth` levels deep and at most
    /// `max_children` children per node.
    pub async fn get_flow(
        &self,
        queue: &str,
        id: &str,
        depth: usize,
        max_children: usize,
    ) -> Option<JobNode> {
        self.store
            .read(|ks| build_node(ks, queue, id, depth, max_children))
    }
}

fn pending_jobs(q: &crate::store::QueueKeyspace) -> usize {
    q.count(JobState::Waiting)
        + q.count(JobState::Paused)
        + q.count(JobState::Prioritized)
        + q.count(JobState::Delayed)
}

fn build_node(ks: &Keyspace, queue: &str, id: &str, depth: usize, max_children: usize) -> Option<JobNode> {
    let job = ks.job(queue, id)?.clone();
    let children = if depth == 0 {
        Vec::new()
    } else {
        ks.queue(queue)
            .and_then(|q| q.dependencies.get(id))
            .map(|deps| {
                deps.child_keys()
                    .filter_map(|key| keys::parse_job_key(key))
                    .filter_map(|(cq, cid)| build_node(ks, cq, cid, depth - 1, max_children))
                    .take(max_children)
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(JobNode { job, children })
}

/// One page request: items after `cursor`, at most `count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Key of the last item already seen
    pub cursor: Option<String>,
    /// Page size
    pub count: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            count: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// First page of `count` items.
    pub fn first(count: usize) -> Self {
        Self {
            cursor: None,
            count,
        }
    }

    /// Page after `cursor`.
    pub fn after(cursor: impl Into<String>, count: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            count,
        }
    }
}

/// Which dependency lists to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyQuery {
    /// Completed children
    pub processed: Option<PageRequest>,
    /// Unfinished children
    pub pending: Option<PageRequest>,
    /// Ignored failed children
    pub failed: Option<PageRequest>,
}

impl DependencyQuery {
    /// First page of every list.
    pub fn all() -> Self {
        Self {
            processed: Some(PageRequest::default()),
            pending: Some(PageRequest::default()),
            failed: Some(PageRequest::default()),
        }
    }
}

/// A page of items and the cursor of the next page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Cursor for the next page, `None` on the last page
    pub next_cursor: Option<String>,
}

/// Dependency listing of one parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    /// Completed children and their values
    pub processed: Option<Page<(String, serde_json::Value)>>,
    /// Unfinished children
    pub pending: Option<Page<String>>,
    /// Ignored failed children and their reasons
    pub failed: Option<Page<(String, String)>>,
}

/// Number of children per list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyCounts {
    /// Completed children
    pub processed: usize,
    /// Unfinished children
    pub pending: usize,
    /// Ignored failed children
    pub failed: usize,
}

fn page<'a, T: 'a>(
    items: impl Iterator<Item = (&'a String, T)>,
    count: usize,
) -> Page<T> {
    let mut out = Vec::new();
    let mut last = None;
    let mut more = false;
    for (key, item) in items {
        if out.len() == count {
            more = true;
            break;
        }
        last = Some(key.clone());
        out.push(item);
    }
    Page {
        items: out,
        next_cursor: if more { last } else { None },
    }
}

fn after(cursor: &Option<String>) -> (Bound<String>, Bound<String>) {
    match cursor {
        Some(c) => (Bound::Excluded(c.clone()), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}

/// Paginate a dependency record.
pub(crate) fn list_dependencies(deps: &DependencyRecord, query: &DependencyQuery) -> Dependencies {
    Dependencies {
        processed: query.processed.as_ref().map(|req| {
            page(
                deps.processed
                    .range::<String, _>(after(&req.cursor))
                    .map(|(k, v)| (k, (k.clone(), v.clone()))),
                req.count,
            )
        }),
        pending: query.pending.as_ref().map(|req| {
            page(
                deps.pending
                    .range::<String, _>(after(&req.cursor))
                    .map(|k| (k, k.clone())),
                req.count,
            )
        }),
        failed: query.failed.as_ref().map(|req| {
            page(
                deps.failed
                    .range::<String, _>(after(&req.cursor))
                    .map(|(k, v)| (k, (k.clone(), v.clone()))),
                req.count,
            )
        }),
    }
}
