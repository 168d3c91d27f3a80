//! Full-path scenarios: producer enqueues through a `Queue`, a
//! `WorkerPool` executes, and the job's terminal state is observed via
//! `status`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use reportsmith_core::{
    BackoffPolicy, Clock, Job, JobErrorKind, JobState, ManualClock, QueueName, WorkerId,
};
use reportsmith_engine::stall::sweep_once;
use reportsmith_engine::{
    EnqueueOptions, JobContext, Processor, ProcessorError, Queue, QueueConfig, StallMonitorConfig,
    WorkerPool, WorkerPoolConfig,
};
use reportsmith_store::{InMemoryJobStore, JobStore};

fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig::default()
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_lock_duration(Duration::from_secs(5))
}

fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn email_succeeds_on_third_attempt() {
    let store = InMemoryJobStore::arc();
    let queue = Queue::new(QueueName::Emails, store.clone(), QueueConfig::default());

    let job_id = queue
        .enqueue(
            &json!({"to": "ops@example.com", "template": "weekly-digest"}),
            EnqueueOptions {
                max_attempts: Some(3),
                backoff: Some(BackoffPolicy::new(Duration::from_millis(20), 2)),
                delay: None,
            },
        )
        .unwrap();

    let deliveries = Arc::new(AtomicU32::new(0));
    let processor = {
        let deliveries = deliveries.clone();
        Arc::new(move |_: &Value, ctx: &mut dyn JobContext| {
            if deliveries.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(ProcessorError::execution("smtp connection refused"));
            }
            ctx.set_progress(100)?;
            Ok(json!({"delivered": true}))
        })
    };
    let handle = WorkerPool::new(store.clone(), QueueName::Emails, processor).spawn(fast_config());

    assert!(wait_for(Duration::from_secs(5), || {
        matches!(
            queue.status(job_id).unwrap().map(|s| s.state),
            Some(JobState::Completed)
        )
    }));
    handle.shutdown();

    let status = queue.status(job_id).unwrap().unwrap();
    assert_eq!(status.attempts_made, 3);
    assert_eq!(status.result, Some(json!({"delivered": true})));
    // A successful attempt clears the error left by earlier ones.
    assert!(status.last_error.is_none());
}

#[test]
fn single_attempt_job_fails_terminally() {
    let store = InMemoryJobStore::arc();
    let queue = Queue::new(QueueName::Files, store.clone(), QueueConfig::default());

    let job_id = queue
        .enqueue(
            &json!({"path": "/tmp/upload.csv"}),
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

    let processor = Arc::new(|_: &Value, _: &mut dyn JobContext| {
        Err(ProcessorError::execution("file vanished"))
    });
    let handle = WorkerPool::new(store.clone(), QueueName::Files, processor).spawn(fast_config());

    assert!(wait_for(Duration::from_secs(5), || {
        matches!(
            queue.status(job_id).unwrap().map(|s| s.state),
            Some(JobState::Failed)
        )
    }));
    handle.shutdown();

    let status = queue.status(job_id).unwrap().unwrap();
    assert_eq!(status.attempts_made, 1);
    let error = status.last_error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Processor);
    assert!(error.message.contains("file vanished"));
}

#[test]
fn delayed_job_waits_for_its_schedule() {
    let store = InMemoryJobStore::arc();
    let queue = Queue::new(QueueName::Reports, store.clone(), QueueConfig::default());

    let job_id = queue
        .enqueue(
            &json!({"template": "quarterly"}),
            EnqueueOptions {
                delay: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        )
        .unwrap();

    let processor = Arc::new(|_: &Value, _: &mut dyn JobContext| Ok(json!({"pages": 12})));
    let handle = WorkerPool::new(store.clone(), QueueName::Reports, processor).spawn(fast_config());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        queue.status(job_id).unwrap().unwrap().state,
        JobState::Waiting
    );

    assert!(wait_for(Duration::from_secs(5), || {
        matches!(
            queue.status(job_id).unwrap().map(|s| s.state),
            Some(JobState::Completed)
        )
    }));
    handle.shutdown();
}

#[test]
fn progress_and_logs_survive_to_the_snapshot() {
    let store = InMemoryJobStore::arc();
    let queue = Queue::new(QueueName::Sync, store.clone(), QueueConfig::default());
    let job_id = queue
        .enqueue(&json!({"connector": "crm"}), EnqueueOptions::default())
        .unwrap();

    let processor = Arc::new(|_: &Value, ctx: &mut dyn JobContext| {
        ctx.append_log("fetched 250 records")?;
        ctx.set_progress(50)?;
        ctx.set_progress(100)?;
        Ok(json!({"records": 250}))
    });
    let handle = WorkerPool::new(store.clone(), QueueName::Sync, processor).spawn(fast_config());

    assert!(wait_for(Duration::from_secs(5), || {
        matches!(
            queue.status(job_id).unwrap().map(|s| s.state),
            Some(JobState::Completed)
        )
    }));
    handle.shutdown();

    assert_eq!(queue.status(job_id).unwrap().unwrap().progress, 100);
    let job = store.get(job_id).unwrap().unwrap();
    assert_eq!(job.logs, vec!["fetched 250 records".to_string()]);
}

#[test]
fn stalled_job_is_reclaimed_and_finished_elsewhere() {
    let clock = Arc::new(ManualClock::from_now());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));

    // A worker claims the job and then dies without reporting.
    let job = Job::new(QueueName::Reports, json!({"template": "annual"}), clock.now());
    let job_id = store.push_ready(job).unwrap();
    store
        .claim_next(QueueName::Reports, WorkerId::new(), Duration::from_secs(30))
        .unwrap()
        .unwrap();
    clock.advance(Duration::from_secs(31));

    let report = sweep_once(
        &*store,
        QueueName::Reports,
        &StallMonitorConfig::default(),
        &*clock,
    )
    .unwrap();
    assert_eq!(report.requeued, 1);

    // Another worker picks it up and completes it.
    let survivor = WorkerId::new();
    let reclaimed = store
        .claim_next(QueueName::Reports, survivor, Duration::from_secs(30))
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.stalled_count, 1);
    // The lost attempt still counted; the reclaim itself did not.
    assert_eq!(reclaimed.attempts_made, 2);
    store.complete(job_id, survivor, json!({"pages": 40})).unwrap();

    assert_eq!(
        store.get(job_id).unwrap().unwrap().state,
        JobState::Completed
    );
}

#[test]
fn queues_are_isolated() {
    let store = InMemoryJobStore::arc();
    let emails = Queue::new(QueueName::Emails, store.clone(), QueueConfig::default());
    let reports = Queue::new(QueueName::Reports, store.clone(), QueueConfig::default());

    let email_id = emails
        .enqueue(&json!({"to": "a@b.com"}), EnqueueOptions::default())
        .unwrap();
    let report_id = reports
        .enqueue(&json!({"template": "q3"}), EnqueueOptions::default())
        .unwrap();

    // Only an email pool runs.
    let processor: Arc<dyn Processor> =
        Arc::new(|_: &Value, _: &mut dyn JobContext| Ok(json!(null)));
    let handle = WorkerPool::new(store.clone(), QueueName::Emails, processor).spawn(fast_config());

    assert!(wait_for(Duration::from_secs(5), || {
        matches!(
            emails.status(email_id).unwrap().map(|s| s.state),
            Some(JobState::Completed)
        )
    }));
    thread::sleep(Duration::from_millis(50));
    handle.shutdown();

    assert_eq!(
        reports.status(report_id).unwrap().unwrap().state,
        JobState::Waiting
    );
    assert_eq!(reports.stats().unwrap().waiting, 1);
}
