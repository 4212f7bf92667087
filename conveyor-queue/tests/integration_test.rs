//! Integration tests for conveyor-queue

use conveyor_queue::*;
use futures::StreamExt;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOCK: Duration = Duration::from_secs(30);

fn manual() -> (MemoryStore, ManualClock) {
    let clock = ManualClock::default();
    (MemoryStore::with_clock(clock.clone()), clock)
}

async fn claim_job(queue: &Queue, token: &str) -> Job {
    match queue.claim(token, "tester", LOCK, None).await.unwrap() {
        ClaimOutcome::Job(job) => *job,
        other => panic!("expected a job, got {:?}", other),
    }
}

fn consistent(store: &MemoryStore, queue: &str) {
    store.read(|ks| {
        if let Some(q) = ks.queue(queue) {
            q.check_consistency().unwrap();
        }
    });
}

#[tokio::test]
async fn test_complete_round_trip() {
    let (store, _) = manual();
    let queue = Queue::new(store.clone(), "round-trip").unwrap();
    let added = queue.add("sum", json!([1, 2, 3])).await.unwrap();

    let claimed = claim_job(&queue, "t1").await;
    assert_eq!(claimed.id, added.id);
    assert_eq!(claimed.attempts_made, 1);

    let done = queue.complete(&claimed.id, "t1", json!(6)).await.unwrap();
    assert_eq!(done.state, JobState::Completed);

    let fetched = queue.get_job(&added.id).await.unwrap();
    assert_eq!(fetched.return_value, Some(json!(6)));
    assert_eq!(fetched.state, JobState::Completed);
    assert!(fetched.finished_on.is_some());
    consistent(&store, "round-trip");
}

#[tokio::test]
async fn test_finishing_requires_the_lock() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "locks").unwrap();
    queue.add("a", json!(null)).await.unwrap();
    let job = claim_job(&queue, "mine").await;

    assert!(matches!(
        queue.complete(&job.id, "theirs", json!(null)).await,
        Err(QueueError::LockMismatch(_))
    ));
    clock.advance(LOCK);
    assert!(matches!(
        queue.complete(&job.id, "mine", json!(null)).await,
        Err(QueueError::MissingLock(_))
    ));
    assert!(matches!(
        queue.complete("404", "mine", json!(null)).await,
        Err(QueueError::MissingKey(_))
    ));
}

#[tokio::test]
async fn test_paused_priorities_claim_in_priority_order() {
    let (store, _) = manual();
    let queue = Queue::new(store, "paused").unwrap();
    queue.pause().await.unwrap();

    let mut ids = Vec::new();
    for priority in [3, 1, 2] {
        let job = queue
            .add_with_options("p", json!(priority), JobOptions::new().with_priority(priority))
            .await
            .unwrap();
        ids.push(job.id);
    }
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { .. }
    ));

    queue.resume().await.unwrap();
    let mut order = Vec::new();
    for n in 0..3 {
        let token = format!("t{}", n);
        let job = claim_job(&queue, &token).await;
        queue.complete(&job.id, &token, json!(null)).await.unwrap();
        order.push(job.id);
    }
    assert_eq!(order, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
}

#[tokio::test]
async fn test_worker_completes_paused_priorities_in_order() {
    let queue = Queue::new(MemoryStore::new(), "paused-worker").unwrap();
    queue.pause().await.unwrap();
    for priority in [3, 1, 2] {
        queue
            .add_with_options("p", json!(priority), JobOptions::new().with_priority(priority))
            .await
            .unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let worker = Worker::new(
        queue.clone(),
        move |job: ActiveJob, _cancel| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(job.data.clone());
                Ok(json!(null))
            }
        },
        WorkerOptions::default()
            .with_concurrency(1)
            .with_drain_delay(Duration::from_millis(50)),
    )
    .unwrap();

    queue.resume().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job_counts(&[JobState::Completed]).await[&JobState::Completed] < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    worker.close(false).await.unwrap();
    assert_eq!(*order.lock(), vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_removed_child_releases_parent_to_waiting() {
    let (store, _) = manual();
    let producer = FlowProducer::new(store.clone());
    let node = producer
        .add(
            FlowJob::new("report", "parents", json!({}))
                .with_children([
                    FlowJob::new("part", "children", json!(1)),
                    FlowJob::new("part", "children", json!(2)),
                ]),
        )
        .await
        .unwrap();
    let parents = Queue::new(store.clone(), "parents").unwrap();
    let children = Queue::new(store.clone(), "children").unwrap();
    let parent_id = node.job.id.clone();

    assert!(children.remove(&node.children[0].job.id, false).await.unwrap());
    assert_eq!(parents.get_state(&parent_id).await, Some(JobState::WaitingChildren));

    let child = claim_job(&children, "c").await;
    assert_eq!(child.id, node.children[1].job.id);
    children.complete(&child.id, "c", json!("part-2")).await.unwrap();

    assert_eq!(parents.get_state(&parent_id).await, Some(JobState::Waiting));
    let counts = parents.get_dependencies_count(&parent_id).await.unwrap();
    assert_eq!(counts.processed, 1);
    assert_eq!(counts.pending, 0);
    let values = parents.get_children_values(&parent_id).await;
    assert_eq!(values.values().collect::<Vec<_>>(), vec![&json!("part-2")]);
    consistent(&store, "parents");
    consistent(&store, "children");
}

#[tokio::test]
async fn test_parent_released_exactly_once() {
    let (store, _) = manual();
    let producer = FlowProducer::new(store.clone());
    let node = producer
        .add(
            FlowJob::new("parent", "flow", json!({}))
                .with_options(JobOptions::new().with_job_id("root"))
                .with_children([
                    FlowJob::new("a", "flow", json!(null)),
                    FlowJob::new("b", "flow", json!(null)),
                ]),
        )
        .await
        .unwrap();
    let queue = Queue::new(store.clone(), "flow").unwrap();

    for n in 0..2 {
        let token = format!("t{}", n);
        let child = claim_job(&queue, &token).await;
        queue.complete(&child.id, &token, json!(n)).await.unwrap();
    }
    // Removing an already processed child must not advance the parent again.
    assert!(queue.remove(&node.children[0].job.id, false).await.unwrap());

    let releases = store.read(|ks| {
        ks.queue("flow")
            .unwrap()
            .events()
            .since(None)
            .into_iter()
            .filter(|e| {
                matches!(
                    &e.event,
                    QueueEvent::Waiting { job_id, prev: Some(JobState::WaitingChildren) } if job_id == "root"
                )
            })
            .count()
    });
    assert_eq!(releases, 1);
    assert_eq!(queue.get_state("root").await, Some(JobState::Waiting));
    assert_eq!(queue.get_dependencies_count("root").await.unwrap().processed, 2);
}

#[tokio::test]
async fn test_parent_is_not_claimable_while_children_pend() {
    let (store, _) = manual();
    FlowProducer::new(store.clone())
        .add(
            FlowJob::new("parent", "deps", json!({}))
                .with_options(JobOptions::new().with_job_id("p"))
                .with_child(FlowJob::new("child", "deps", json!(null))),
        )
        .await
        .unwrap();
    let queue = Queue::new(store, "deps").unwrap();
    let child = claim_job(&queue, "c").await;
    assert_ne!(child.id, "p");
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { .. }
    ));
}

#[tokio::test]
async fn test_stalled_sweep_requeues_expired_and_spares_live_locks() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "stalled").unwrap();
    queue.add("dead", json!(null)).await.unwrap();
    queue.add("alive", json!(null)).await.unwrap();
    let lock = Duration::from_secs(1);
    let dead = match queue.claim("t-dead", "w", lock, None).await.unwrap() {
        ClaimOutcome::Job(job) => job,
        other => panic!("unexpected {:?}", other),
    };
    let alive = match queue.claim("t-alive", "w", lock, None).await.unwrap() {
        ClaimOutcome::Job(job) => job,
        other => panic!("unexpected {:?}", other),
    };

    let first = queue.check_stalled(1, Duration::ZERO).await.unwrap();
    assert!(first.ran);
    assert!(first.recovered.is_empty());

    // The live worker keeps renewing; the dead one does not.
    clock.advance(Duration::from_millis(500));
    assert!(queue.extend_lock(&alive.id, "t-alive", Duration::from_secs(5)).await);
    clock.advance(Duration::from_secs(1));
    let second = queue.check_stalled(1, Duration::ZERO).await.unwrap();

    assert_eq!(second.recovered, vec![dead.id.clone()]);
    assert_eq!(queue.get_state(&dead.id).await, Some(JobState::Waiting));
    assert_eq!(queue.get_state(&alive.id).await, Some(JobState::Active));
    let recovered = queue.get_job(&dead.id).await.unwrap();
    assert_eq!(recovered.stalled_counter, 1);
    assert!(matches!(
        queue.complete(&dead.id, "t-dead", json!(null)).await,
        Err(QueueError::MissingLock(_)) | Err(QueueError::NotInState { .. })
    ));
    queue.complete(&alive.id, "t-alive", json!(null)).await.unwrap();
    consistent(&store, "stalled");
}

#[tokio::test]
async fn test_stalled_past_limit_fails() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "stall-limit").unwrap();
    queue.add("dead", json!(null)).await.unwrap();
    let job = claim_job(&queue, "t").await;

    queue.check_stalled(0, Duration::ZERO).await.unwrap();
    clock.advance(LOCK * 2);
    let report = queue.check_stalled(0, Duration::ZERO).await.unwrap();

    assert_eq!(report.failed, vec![job.id.clone()]);
    let failed = queue.get_job(&job.id).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failed_reason.as_deref(), Some(stalled::STALLED_FAILURE_REASON));
}

#[tokio::test]
async fn test_rate_limited_claims_are_spaced() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "limited").unwrap();
    let limiter = RateLimiterOptions::new(1, Duration::from_secs(1));
    for n in 0..3 {
        queue.add("n", json!(n)).await.unwrap();
    }

    let mut claimed_at = Vec::new();
    while claimed_at.len() < 3 {
        let token = format!("t{}", claimed_at.len());
        match queue.claim(&token, "w", LOCK, Some(&limiter)).await.unwrap() {
            ClaimOutcome::Job(job) => {
                claimed_at.push(store.now_ms());
                queue.complete(&job.id, &token, json!(null)).await.unwrap();
            }
            ClaimOutcome::RateLimited { ttl_ms } => {
                assert!(ttl_ms > 0);
                clock.advance(Duration::from_millis(ttl_ms as u64));
            }
            ClaimOutcome::NoJobsAvailable { .. } => panic!("jobs are waiting"),
        }
    }
    for pair in claimed_at.windows(2) {
        assert!(pair[1] - pair[0] >= 1_000);
    }
}

#[tokio::test]
async fn test_groups_are_limited_independently() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "groups").unwrap();
    let limiter = RateLimiterOptions::new(1, Duration::from_secs(1)).with_group_key("tenant");
    queue.add("a1", json!({"tenant": "a"})).await.unwrap();
    queue.add("a2", json!({"tenant": "a"})).await.unwrap();
    queue.add("b1", json!({"tenant": "b"})).await.unwrap();

    let mut names = Vec::new();
    for n in 0..3 {
        let token = format!("t{}", n);
        if let ClaimOutcome::Job(job) = queue.claim(&token, "w", LOCK, Some(&limiter)).await.unwrap() {
            names.push(job.name.clone());
            queue.complete(&job.id, &token, json!(null)).await.unwrap();
        }
    }
    // Without waiting, one job from each group went through.
    assert_eq!(names, vec!["a1".to_string(), "b1".to_string()]);
    assert_eq!(queue.get_job_counts(&[JobState::Delayed]).await[&JobState::Delayed], 1);

    clock.advance(Duration::from_secs(1));
    match queue.claim("late", "w", LOCK, Some(&limiter)).await.unwrap() {
        ClaimOutcome::Job(job) => assert_eq!(job.name, "a2"),
        other => panic!("unexpected {:?}", other),
    }
    consistent(&store, "groups");
}

#[tokio::test]
async fn test_worker_respects_limiter_spacing() {
    let queue = Queue::new(MemoryStore::new(), "worker-limited").unwrap();
    for n in 0..3 {
        queue.add("n", json!(n)).await.unwrap();
    }
    let started = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&started);
    let worker = Worker::new(
        queue.clone(),
        move |_job: ActiveJob, _cancel| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(Instant::now());
                Ok(json!(null))
            }
        },
        WorkerOptions::default()
            .with_concurrency(3)
            .with_limiter(RateLimiterOptions::new(1, Duration::from_millis(200))),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while started.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    worker.close(false).await.unwrap();

    let started = started.lock();
    for pair in started.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(190));
    }
}

#[tokio::test]
async fn test_rate_limit_error_keeps_the_attempt() {
    let (store, _) = manual();
    let queue = Queue::new(store, "release").unwrap();
    let added = queue.add("a", json!(null)).await.unwrap();
    let job = claim_job(&queue, "t").await;
    assert_eq!(job.attempts_made, 1);

    queue.rate_limit(Duration::from_secs(5)).await.unwrap();
    queue.release_rate_limited(&job.id, "t").await.unwrap();
    let released = queue.get_job(&added.id).await.unwrap();
    assert_eq!(released.state, JobState::Waiting);
    assert_eq!(released.attempts_made, 0);
    assert!(matches!(
        queue.claim("t2", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::RateLimited { ttl_ms: 5_000 }
    ));
}

#[tokio::test]
async fn test_concurrent_upserts_keep_one_pending_instance() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "sched").unwrap();

    let mut tasks = Vec::new();
    for n in 0..16u64 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue
                .upsert_job_scheduler(
                    "tick",
                    RepeatOptions::every(Duration::from_secs(1 + n % 3)),
                    JobTemplate::new("tick", json!(n)),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let pending = |queue: Queue| async move {
        queue
            .get_jobs(&[JobState::Waiting, JobState::Delayed, JobState::Prioritized], 0, None, true)
            .await
            .into_iter()
            .filter(|j| j.repeat_job_key.as_deref() == Some("tick"))
            .count()
    };
    assert_eq!(pending(queue.clone()).await, 1);

    // Completing an instance produces the next one, never two.
    clock.advance(Duration::from_secs(5));
    let job = claim_job(&queue, "t").await;
    assert_eq!(job.repeat_job_key.as_deref(), Some("tick"));
    queue.complete(&job.id, "t", json!(null)).await.unwrap();
    assert_eq!(pending(queue.clone()).await, 1);
    let scheduler = queue.get_job_scheduler("tick").await.unwrap();
    assert!(scheduler.pending_job_id.is_some());
    assert_ne!(scheduler.pending_job_id, Some(job.id));
    consistent(&store, "sched");
}

#[tokio::test]
async fn test_retry_backoff_then_exhaust() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "retry").unwrap();
    let added = queue
        .add_with_options(
            "flaky",
            json!(null),
            JobOptions::new()
                .with_attempts(2)
                .with_backoff(Backoff::fixed(Duration::from_secs(10))),
        )
        .await
        .unwrap();

    let job = claim_job(&queue, "t1").await;
    let retried = queue.fail(&job.id, "t1", "boom", false).await.unwrap();
    assert_eq!(retried.state, JobState::Delayed);

    clock.advance(Duration::from_secs(10));
    let job = claim_job(&queue, "t2").await;
    assert_eq!(job.attempts_made, 2);
    let failed = queue.fail(&job.id, "t2", "boom again", false).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failed_reason.as_deref(), Some("boom again"));

    assert_eq!(queue.retry_jobs(JobState::Failed, None).await.unwrap(), 1);
    let reset = queue.get_job(&added.id).await.unwrap();
    assert_eq!(reset.state, JobState::Waiting);
    assert_eq!(reset.attempts_made, 0);
}

#[tokio::test]
async fn test_unrecoverable_failure_skips_retries() {
    let (store, _) = manual();
    let queue = Queue::new(store, "unrecoverable").unwrap();
    queue
        .add_with_options("a", json!(null), JobOptions::new().with_attempts(5))
        .await
        .unwrap();
    let job = claim_job(&queue, "t").await;
    let failed = queue.fail(&job.id, "t", "bad input", true).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
}

#[tokio::test]
async fn test_event_subscription_replays_from_offset() {
    let (store, _) = manual();
    let queue = Queue::new(store, "events").unwrap();
    let events = queue.events();
    let first = queue.add("a", json!(null)).await.unwrap();
    let offset = events.last_event_id().unwrap();
    queue.add("b", json!(null)).await.unwrap();

    let mut replay = Box::pin(events.subscribe(EventOffset::After(offset)));
    let next = tokio::time::timeout(Duration::from_secs(1), replay.next())
        .await
        .unwrap()
        .unwrap();
    assert!(next.id > offset);
    assert_ne!(next.event.job_id(), Some(first.id.as_str()));

    let mut removed = Box::pin(events.subscribe_kind(EventKind::Removed, EventOffset::Latest));
    queue.remove(&first.id, false).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), removed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event.job_id(), Some(first.id.as_str()));
}

#[tokio::test]
async fn test_clean_and_drain() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "maintenance").unwrap();
    for n in 0..3 {
        queue.add("n", json!(n)).await.unwrap();
    }
    let job = claim_job(&queue, "t").await;
    queue.complete(&job.id, "t", json!(null)).await.unwrap();

    clock.advance(Duration::from_secs(60));
    let cleaned = queue
        .clean(Duration::from_secs(30), 0, JobState::Completed)
        .await
        .unwrap();
    assert_eq!(cleaned, vec![job.id]);

    assert_eq!(queue.drain(false).await.unwrap(), 2);
    assert_eq!(queue.count().await, 0);
}

#[tokio::test]
async fn test_persist_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queues.json");
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "durable").unwrap();
    let job = queue
        .add_with_options("later", json!({"k": "v"}), JobOptions::new().with_delay(Duration::from_secs(5)))
        .await
        .unwrap();
    store.persist(&path).await.unwrap();

    let reopened = MemoryStore::open_with_clock(&path, clock.clone()).await.unwrap();
    let queue = Queue::new(reopened.clone(), "durable").unwrap();
    assert_eq!(queue.get_state(&job.id).await, Some(JobState::Delayed));
    assert_eq!(queue.get_job(&job.id).await.unwrap().data, json!({"k": "v"}));

    clock.advance(Duration::from_secs(5));
    assert_eq!(claim_job(&queue, "t").await.id, job.id);
    consistent(&reopened, "durable");
}

// =============================================================================
// Parent failure policies
// =============================================================================

async fn single_child_flow(store: &MemoryStore, queue: &str, policy: ParentFailurePolicy) {
    FlowProducer::new(store.clone())
        .add(
            FlowJob::new("parent", queue, json!({}))
                .with_options(JobOptions::new().with_job_id("parent"))
                .with_child(
                    FlowJob::new("child", queue, json!(null)).with_options(
                        JobOptions::new()
                            .with_job_id("child")
                            .with_parent_failure(policy),
                    ),
                ),
        )
        .await
        .unwrap();
}

async fn fail_child(queue: &Queue) {
    let child = claim_job(queue, "c").await;
    assert_eq!(child.id, "child");
    queue.fail("child", "c", "boom", true).await.unwrap();
}

#[tokio::test]
async fn test_fail_parent_cascades_up_the_chain() {
    let (store, _) = manual();
    FlowProducer::new(store.clone())
        .add(
            FlowJob::new("root", "chain", json!({}))
                .with_options(JobOptions::new().with_job_id("root"))
                .with_child(
                    FlowJob::new("middle", "chain", json!({}))
                        .with_options(
                            JobOptions::new()
                                .with_job_id("middle")
                                .with_parent_failure(ParentFailurePolicy::FailParent),
                        )
                        .with_child(FlowJob::new("leaf", "chain", json!(null)).with_options(
                            JobOptions::new()
                                .with_job_id("leaf")
                                .with_parent_failure(ParentFailurePolicy::FailParent),
                        )),
                ),
        )
        .await
        .unwrap();
    let queue = Queue::new(store.clone(), "chain").unwrap();

    let leaf = claim_job(&queue, "l").await;
    assert_eq!(leaf.id, "leaf");
    queue.fail("leaf", "l", "boom", true).await.unwrap();

    let middle = queue.get_job("middle").await.unwrap();
    assert_eq!(middle.state, JobState::Failed);
    assert_eq!(middle.failed_reason.as_deref(), Some("child chain:leaf failed"));
    let root = queue.get_job("root").await.unwrap();
    assert_eq!(root.state, JobState::Failed);
    assert_eq!(root.failed_reason.as_deref(), Some("child chain:middle failed"));
    assert_eq!(queue.get_dependencies_count("root").await.unwrap().failed, 1);
    consistent(&store, "chain");
}

#[tokio::test]
async fn test_ignore_dependency_releases_parent_with_failed_child() {
    let (store, _) = manual();
    single_child_flow(&store, "ignore", ParentFailurePolicy::IgnoreDependency).await;
    let queue = Queue::new(store.clone(), "ignore").unwrap();
    fail_child(&queue).await;

    assert_eq!(queue.get_state("parent").await, Some(JobState::Waiting));
    let counts = queue.get_dependencies_count("parent").await.unwrap();
    assert_eq!((counts.pending, counts.processed, counts.failed), (0, 0, 1));
    let deps = queue
        .get_dependencies("parent", DependencyQuery::all())
        .await
        .unwrap();
    assert_eq!(
        deps.failed.unwrap().items,
        vec![("ignore:child".to_string(), "boom".to_string())]
    );
    consistent(&store, "ignore");
}

#[tokio::test]
async fn test_remove_dependency_releases_parent_without_the_child() {
    let (store, _) = manual();
    single_child_flow(&store, "drop", ParentFailurePolicy::RemoveDependency).await;
    let queue = Queue::new(store.clone(), "drop").unwrap();
    fail_child(&queue).await;

    assert_eq!(queue.get_state("parent").await, Some(JobState::Waiting));
    let counts = queue.get_dependencies_count("parent").await.unwrap();
    assert_eq!((counts.pending, counts.processed, counts.failed), (0, 0, 0));
    consistent(&store, "drop");
}

#[tokio::test]
async fn test_default_policy_keeps_parent_blocked() {
    let (store, _) = manual();
    single_child_flow(&store, "keep", ParentFailurePolicy::default()).await;
    let queue = Queue::new(store.clone(), "keep").unwrap();
    fail_child(&queue).await;

    assert_eq!(queue.get_state("parent").await, Some(JobState::WaitingChildren));
    assert_eq!(queue.get_dependencies_count("parent").await.unwrap().pending, 1);
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { .. }
    ));
}

// =============================================================================
// Waiting on children from an active job
// =============================================================================

#[tokio::test]
async fn test_move_to_waiting_children_only_blocks_on_pending_children() {
    let (store, _) = manual();
    FlowProducer::new(store.clone())
        .add(
            FlowJob::new("parent", "steps", json!({}))
                .with_options(JobOptions::new().with_job_id("parent"))
                .with_child(
                    FlowJob::new("child", "steps", json!(null))
                        .with_options(JobOptions::new().with_job_id("child")),
                ),
        )
        .await
        .unwrap();
    let queue = Queue::new(store.clone(), "steps").unwrap();
    let child = claim_job(&queue, "c").await;
    queue.complete(&child.id, "c", json!(1)).await.unwrap();

    let parent = claim_job(&queue, "p").await;
    assert_eq!(parent.id, "parent");
    assert!(!queue.move_to_waiting_children("parent", "p", None).await.unwrap());
    assert!(!queue.move_to_waiting_children("parent", "p", Some("steps:child")).await.unwrap());
    assert_eq!(queue.get_state("parent").await, Some(JobState::Active));

    // A child added while the parent runs blocks it again.
    queue
        .add_with_options(
            "late",
            json!(null),
            JobOptions::new()
                .with_job_id("late")
                .with_parent(ParentRef::new("steps", "parent")),
        )
        .await
        .unwrap();
    assert!(queue.move_to_waiting_children("parent", "p", None).await.unwrap());
    let blocked = queue.get_job("parent").await.unwrap();
    assert_eq!(blocked.state, JobState::WaitingChildren);
    assert_eq!(blocked.attempts_made, 0);
    assert!(matches!(
        queue.complete("parent", "p", json!(null)).await,
        Err(QueueError::MissingLock(_))
    ));
    consistent(&store, "steps");
}

// =============================================================================
// Schedulers running out
// =============================================================================

#[tokio::test]
async fn test_scheduler_stops_at_its_limit() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "capped").unwrap();
    queue
        .upsert_job_scheduler(
            "twice",
            RepeatOptions::every(Duration::from_secs(1)).with_limit(2),
            JobTemplate::new("tick", json!(null)),
        )
        .await
        .unwrap();

    for n in 1..=2u64 {
        clock.advance(Duration::from_millis(1_200));
        let token = format!("t{}", n);
        let job = claim_job(&queue, &token).await;
        assert_eq!(job.iteration, Some(n));
        queue.complete(&job.id, &token, json!(null)).await.unwrap();
    }

    let scheduler = queue.get_job_scheduler("twice").await.unwrap();
    assert_eq!(scheduler.iteration_count, 2);
    assert_eq!(scheduler.pending_job_id, None);
    clock.advance(Duration::from_secs(10));
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { next_due: None }
    ));
}

#[tokio::test]
async fn test_scheduler_stops_after_end_date() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "ending").unwrap();
    let end = chrono::DateTime::from_timestamp_millis(store.now_ms() + 1_500).unwrap();
    let first = queue
        .upsert_job_scheduler(
            "until",
            RepeatOptions::every(Duration::from_secs(1)).with_end_date(end),
            JobTemplate::new("tick", json!(null)),
        )
        .await
        .unwrap()
        .unwrap();

    clock.advance(Duration::from_millis(1_200));
    let job = claim_job(&queue, "t").await;
    assert_eq!(job.id, first.id);
    queue.complete(&job.id, "t", json!(null)).await.unwrap();

    let scheduler = queue.get_job_scheduler("until").await.unwrap();
    assert_eq!(scheduler.pending_job_id, None);
    assert_eq!(queue.get_job_counts(&[JobState::Delayed]).await[&JobState::Delayed], 0);
}

// =============================================================================
// Group throttling
// =============================================================================

#[tokio::test]
async fn test_dynamic_group_throttle_redelays_only_that_group() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "dyn-groups").unwrap();
    let limiter = RateLimiterOptions::new(100, Duration::from_secs(1)).with_group_key("tenant");
    let acme = queue.add("a", json!({"tenant": "acme"})).await.unwrap();
    let globex = queue.add("g", json!({"tenant": "globex"})).await.unwrap();

    queue.rate_limit_group("acme", Duration::from_secs(5)).await.unwrap();
    match queue.claim("t1", "w", LOCK, Some(&limiter)).await.unwrap() {
        ClaimOutcome::Job(job) => assert_eq!(job.id, globex.id),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(queue.get_state(&acme.id).await, Some(JobState::Delayed));

    clock.advance(Duration::from_secs(5));
    match queue.claim("t2", "w", LOCK, Some(&limiter)).await.unwrap() {
        ClaimOutcome::Job(job) => assert_eq!(job.id, acme.id),
        other => panic!("unexpected {:?}", other),
    }
    consistent(&store, "dyn-groups");
}

#[tokio::test]
async fn test_group_limited_job_goes_through_after_max_delay() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "max-delay").unwrap();
    let limiter = RateLimiterOptions::new(1, Duration::from_secs(10))
        .with_group_key("tenant")
        .with_max_delay(Duration::from_millis(300));
    queue.add("first", json!({"tenant": "a"})).await.unwrap();
    let second = queue.add("second", json!({"tenant": "a"})).await.unwrap();

    let first = match queue.claim("t1", "w", LOCK, Some(&limiter)).await.unwrap() {
        ClaimOutcome::Job(job) => *job,
        other => panic!("unexpected {:?}", other),
    };
    queue.complete(&first.id, "t1", json!(null)).await.unwrap();
    let start = store.now_ms();
    assert!(matches!(
        queue.claim("t2", "w", LOCK, Some(&limiter)).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { next_due: Some(due) } if due == start + 300
    ));
    assert_eq!(queue.get_job(&second.id).await.unwrap().rate_limited_since, Some(start));

    // The group window is still closed for almost ten seconds.
    clock.advance(Duration::from_millis(300));
    match queue.claim("t3", "w", LOCK, Some(&limiter)).await.unwrap() {
        ClaimOutcome::Job(job) => {
            assert_eq!(job.id, second.id);
            assert_eq!(job.rate_limited_since, None);
        }
        other => panic!("unexpected {:?}", other),
    }
    consistent(&store, "max-delay");
}

// =============================================================================
// Stale workers
// =============================================================================

#[tokio::test]
async fn test_stale_token_after_stalled_recovery_is_rejected() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "stale").unwrap();
    queue.add("slow", json!(null)).await.unwrap();
    let job = match queue.claim("old", "w1", Duration::from_secs(1), None).await.unwrap() {
        ClaimOutcome::Job(job) => *job,
        other => panic!("unexpected {:?}", other),
    };
    queue.check_stalled(1, Duration::ZERO).await.unwrap();
    clock.advance(Duration::from_secs(2));
    let report = queue.check_stalled(1, Duration::ZERO).await.unwrap();
    assert_eq!(report.recovered, vec![job.id.clone()]);
    assert!(queue.complete(&job.id, "old", json!("late")).await.is_err());
    assert_eq!(queue.get_state(&job.id).await, Some(JobState::Waiting));

    let reclaimed = claim_job(&queue, "new").await;
    assert_eq!(reclaimed.id, job.id);
    let before = queue.get_job(&job.id).await.unwrap();

    assert!(matches!(
        queue.complete(&job.id, "old", json!("late")).await,
        Err(QueueError::LockMismatch(_))
    ));
    assert!(matches!(
        queue.fail(&job.id, "old", "late", false).await,
        Err(QueueError::LockMismatch(_))
    ));
    assert_eq!(queue.get_job(&job.id).await.unwrap(), before);

    let done = queue.complete(&job.id, "new", json!("fresh")).await.unwrap();
    assert_eq!(done.return_value, Some(json!("fresh")));
    consistent(&store, "stale");
}

// =============================================================================
// Oversized durations
// =============================================================================

#[tokio::test]
async fn test_huge_rate_limit_saturates() {
    let (store, _) = manual();
    let queue = Queue::new(store, "huge-limit").unwrap();
    queue.add("a", json!(null)).await.unwrap();

    queue.rate_limit(Duration::MAX).await.unwrap();
    assert!(queue.get_rate_limit_ttl(None).await.unwrap() > Duration::from_secs(365 * 24 * 3600));
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::RateLimited { .. }
    ));
    queue.rate_limit_group("g", Duration::MAX).await.unwrap();
}

#[tokio::test]
async fn test_huge_delays_stay_delayed() {
    let (store, clock) = manual();
    let queue = Queue::new(store.clone(), "huge-delay").unwrap();
    let forever = queue
        .add_with_options("later", json!(null), JobOptions::new().with_delay(Duration::MAX))
        .await
        .unwrap();
    let changed = queue
        .add_with_options("soon", json!(null), JobOptions::new().with_delay(Duration::from_secs(1)))
        .await
        .unwrap();
    queue.change_delay(&changed.id, Duration::MAX).await.unwrap();

    clock.advance(Duration::from_secs(3600));
    assert!(matches!(
        queue.claim("t", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { next_due: Some(i64::MAX) }
    ));
    assert_eq!(queue.get_state(&forever.id).await, Some(JobState::Delayed));
    assert_eq!(queue.get_state(&changed.id).await, Some(JobState::Delayed));

    queue.promote(&forever.id).await.unwrap();
    assert_eq!(claim_job(&queue, "t").await.id, forever.id);
    consistent(&store, "huge-delay");
}

#[tokio::test]
async fn test_huge_backoff_stays_delayed() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "huge-backoff").unwrap();
    queue
        .add_with_options(
            "flaky",
            json!(null),
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(Backoff::exponential(Duration::MAX)),
        )
        .await
        .unwrap();
    let job = claim_job(&queue, "t").await;
    let retried = queue.fail(&job.id, "t", "boom", false).await.unwrap();
    assert_eq!(retried.state, JobState::Delayed);

    clock.advance(Duration::from_secs(3600));
    assert!(matches!(
        queue.claim("t2", "w", LOCK, None).await.unwrap(),
        ClaimOutcome::NoJobsAvailable { .. }
    ));
}

#[tokio::test]
async fn test_huge_lock_duration_never_stalls() {
    let (store, clock) = manual();
    let queue = Queue::new(store, "huge-lock").unwrap();
    queue.add("a", json!(null)).await.unwrap();
    let job = match queue.claim("t", "w", Duration::MAX, None).await.unwrap() {
        ClaimOutcome::Job(job) => *job,
        other => panic!("unexpected {:?}", other),
    };
    assert!(queue.extend_lock(&job.id, "t", Duration::MAX).await);

    queue.check_stalled(1, Duration::ZERO).await.unwrap();
    clock.advance(Duration::from_secs(3600));
    let report = queue.check_stalled(1, Duration::MAX).await.unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(queue.get_state(&job.id).await, Some(JobState::Active));
    queue.complete(&job.id, "t", json!(null)).await.unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Add { priority: u32, delay_ms: u64 },
    Claim,
    Complete(usize),
    Fail(usize),
    Pause,
    Resume,
    Advance(u64),
    Remove(usize),
    Promote(usize),
    Sweep,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..3, prop_oneof![Just(0u64), 1u64..2_000]).prop_map(|(priority, delay_ms)| Op::Add { priority, delay_ms }),
        Just(Op::Claim),
        any::<usize>().prop_map(Op::Complete),
        any::<usize>().prop_map(Op::Fail),
        Just(Op::Pause),
        Just(Op::Resume),
        (1u64..5_000).prop_map(Op::Advance),
        any::<usize>().prop_map(Op::Remove),
        any::<usize>().prop_map(Op::Promote),
        Just(Op::Sweep),
    ]
}

proptest! {
    #[test]
    fn prop_every_job_is_in_exactly_one_state_set(ops in proptest::collection::vec(op(), 1..60)) {
        let (store, clock) = manual();
        let queue = Queue::new(store.clone(), "prop").unwrap();
        let mut held: Vec<(JobId, String)> = Vec::new();
        let mut tokens = 0usize;

        futures::executor::block_on(async {
            for op in ops {
                match op {
                    Op::Add { priority, delay_ms } => {
                        let opts = JobOptions::new()
                            .with_priority(priority)
                            .with_attempts(2)
                            .with_delay(Duration::from_millis(delay_ms));
                        queue.add_with_options("p", json!(null), opts).await.unwrap();
                    }
                    Op::Claim => {
                        tokens += 1;
                        let token = format!("t{}", tokens);
                        if let Ok(ClaimOutcome::Job(job)) = queue.claim(&token, "w", Duration::from_secs(3), None).await {
                            held.push((job.id.clone(), token));
                        }
                    }
                    Op::Complete(i) if !held.is_empty() => {
                        let (id, token) = held.remove(i % held.len());
                        let _ = queue.complete(&id, &token, json!(null)).await;
                    }
                    Op::Fail(i) if !held.is_empty() => {
                        let (id, token) = held.remove(i % held.len());
                        let _ = queue.fail(&id, &token, "nope", false).await;
                    }
                    Op::Pause => queue.pause().await.unwrap(),
                    Op::Resume => queue.resume().await.unwrap(),
                    Op::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                    Op::Remove(i) | Op::Promote(i) => {
                        let ids: Vec<JobId> = queue
                            .get_jobs(&JobState::ALL, 0, None, true)
                            .await
                            .into_iter()
                            .map(|j| j.id)
                            .collect();
                        if !ids.is_empty() {
                            let id = &ids[i % ids.len()];
                            if matches!(op, Op::Remove(_)) {
                                let _ = queue.remove(id, false).await;
                            } else {
                                let _ = queue.promote(id).await;
                            }
                        }
                    }
                    Op::Sweep => {
                        let _ = queue.check_stalled(1, Duration::ZERO).await;
                    }
                    Op::Complete(_) | Op::Fail(_) => {}
                }
                let check = store.read(|ks| ks.queue("prop").map(|q| q.check_consistency()));
                prop_assert!(matches!(check, None | Some(Ok(()))), "inconsistent: {:?}", check);
            }
            Ok(())
        })?;
    }
}
