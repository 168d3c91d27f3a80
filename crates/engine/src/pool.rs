//! Bounded-concurrency execution loop for one queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use reportsmith_core::{Job, JobError, JobId, QueueName, RetryDecision, WorkerId};
use reportsmith_store::{JobStore, StoreError};

use crate::processor::{JobContext, Processor, ProcessorError};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Execution slots; at most this many jobs from the queue are active
    /// per pool instance.
    pub concurrency: usize,
    /// How long to wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Lock lifetime stamped on claim and on every heartbeat renewal.
    pub lock_duration: Duration,
    /// Name for thread names and logging.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            lock_duration: Duration::from_secs(30),
            name: "worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Locks are renewed well inside the stall-detection window.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lock_duration / 3).max(Duration::from_millis(10))
    }
}

/// Pool runtime counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Jobs dropped without a report because the lock moved to another
    /// owner mid-execution.
    pub jobs_abandoned: u64,
    pub in_flight: usize,
}

struct InFlightEntry {
    worker: WorkerId,
    abandoned: Arc<AtomicBool>,
}

type InFlightMap = Arc<Mutex<HashMap<JobId, InFlightEntry>>>;

/// A pool of execution slots bound to one queue and one processor.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    queue: QueueName,
    processor: Arc<dyn Processor>,
}

/// Returned by [`WorkerPoolHandle::drain`] when in-flight processors did
/// not finish inside the timeout.
#[derive(Debug, Error)]
#[error("drain timed out with jobs still in flight")]
pub struct DrainTimeout;

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    stopping: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Stop claiming, let in-flight processors run to completion, join.
    pub fn shutdown(mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    /// Like [`shutdown`](Self::shutdown) but bounded: reports failure if
    /// in-flight work outlives the timeout (the threads are left to
    /// finish detached in that case).
    pub fn drain(mut self, timeout: Duration) -> Result<(), DrainTimeout> {
        self.stopping.store(true, Ordering::SeqCst);
        let joins: Vec<_> = self.joins.drain(..).collect();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            for join in joins {
                let _ = join.join();
            }
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(timeout).map_err(|_| DrainTimeout)
    }
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, queue: QueueName, processor: Arc<dyn Processor>) -> Self {
        Self {
            store,
            queue,
            processor,
        }
    }

    /// Spawn the slot threads and the heartbeat thread.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let stopping = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let in_flight: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let mut joins = Vec::new();

        for slot in 0..config.concurrency.max(1) {
            let worker = WorkerId::new();
            let store = self.store.clone();
            let processor = self.processor.clone();
            let config = config.clone();
            let stopping = stopping.clone();
            let stats = stats.clone();
            let in_flight = in_flight.clone();
            let queue = self.queue;

            let join = thread::Builder::new()
                .name(format!("{}-{}-{}", config.name, queue, slot))
                .spawn(move || {
                    slot_loop(store, queue, processor, config, worker, stopping, in_flight, stats)
                })
                .expect("failed to spawn worker slot thread");
            joins.push(join);
        }

        {
            let store = self.store.clone();
            let config = config.clone();
            let stopping = stopping.clone();
            let in_flight = in_flight.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{}-heartbeat", config.name, self.queue))
                .spawn(move || heartbeat_loop(store, config, stopping, in_flight))
                .expect("failed to spawn heartbeat thread");
            joins.push(join);
        }

        info!(queue = %self.queue, concurrency = config.concurrency, "worker pool started");
        WorkerPoolHandle {
            stopping,
            joins,
            stats,
        }
    }
}

/// Context handle backing `set_progress`/`append_log` with owner-checked
/// store writes.
struct StoreJobContext<'a> {
    store: &'a dyn JobStore,
    job_id: JobId,
    worker: WorkerId,
    attempts_made: u32,
}

impl JobContext for StoreJobContext<'_> {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    fn set_progress(&mut self, progress: u8) -> Result<(), ProcessorError> {
        match self.store.set_progress(self.job_id, self.worker, progress) {
            Ok(()) => Ok(()),
            Err(StoreError::LockLost(_)) => Err(ProcessorError::LockLost),
            Err(e) => Err(ProcessorError::execution(format!("progress write: {e}"))),
        }
    }

    fn append_log(&mut self, line: &str) -> Result<(), ProcessorError> {
        match self.store.append_log(self.job_id, self.worker, line) {
            Ok(()) => Ok(()),
            Err(StoreError::LockLost(_)) => Err(ProcessorError::LockLost),
            Err(e) => Err(ProcessorError::execution(format!("log write: {e}"))),
        }
    }
}

fn slot_loop(
    store: Arc<dyn JobStore>,
    queue: QueueName,
    processor: Arc<dyn Processor>,
    config: WorkerPoolConfig,
    worker: WorkerId,
    stopping: Arc<AtomicBool>,
    in_flight: InFlightMap,
    stats: Arc<Mutex<WorkerStats>>,
) {
    debug!(queue = %queue, worker = %worker, "worker slot started");

    while !stopping.load(Ordering::SeqCst) {
        match store.claim_next(queue, worker, config.lock_duration) {
            Ok(Some(job)) => {
                run_one(&*store, &*processor, job, worker, &in_flight, &stats);
            }
            Ok(None) => sleep_interruptible(&stopping, config.poll_interval),
            Err(e) => {
                // Store-connectivity trouble is operational; back off one
                // poll interval and try again.
                error!(queue = %queue, worker = %worker, error = %e, "failed to claim job");
                sleep_interruptible(&stopping, config.poll_interval);
            }
        }
    }

    debug!(queue = %queue, worker = %worker, "worker slot stopped");
}

enum AttemptOutcome {
    Completed,
    Retried,
    Failed,
    Abandoned,
}

fn run_one(
    store: &dyn JobStore,
    processor: &dyn Processor,
    job: Job,
    worker: WorkerId,
    in_flight: &InFlightMap,
    stats: &Arc<Mutex<WorkerStats>>,
) {
    debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "claimed job");

    let abandoned = Arc::new(AtomicBool::new(false));
    in_flight.lock().unwrap().insert(
        job.id,
        InFlightEntry {
            worker,
            abandoned: abandoned.clone(),
        },
    );
    stats.lock().unwrap().in_flight += 1;

    let mut ctx = StoreJobContext {
        store,
        job_id: job.id,
        worker,
        attempts_made: job.attempts_made,
    };
    let execution = processor.execute(&job.payload, &mut ctx);

    in_flight.lock().unwrap().remove(&job.id);

    let outcome = if abandoned.load(Ordering::SeqCst) {
        debug!(job_id = %job.id, "lock lost during execution; abandoning");
        AttemptOutcome::Abandoned
    } else {
        report_attempt(store, &job, worker, execution)
    };

    let mut s = stats.lock().unwrap();
    s.in_flight = s.in_flight.saturating_sub(1);
    s.jobs_processed += 1;
    match outcome {
        AttemptOutcome::Completed => s.jobs_completed += 1,
        AttemptOutcome::Retried => s.jobs_retried += 1,
        AttemptOutcome::Failed => s.jobs_failed += 1,
        AttemptOutcome::Abandoned => s.jobs_abandoned += 1,
    }
}

/// Report the attempt's result to the store, applying the retry policy on
/// failure. `LockLost` at any point means another owner has the job; it is
/// dropped silently, never reported as success or failure.
fn report_attempt(
    store: &dyn JobStore,
    job: &Job,
    worker: WorkerId,
    execution: Result<serde_json::Value, ProcessorError>,
) -> AttemptOutcome {
    match execution {
        Ok(result) => match store.complete(job.id, worker, result) {
            Ok(()) => {
                info!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "job completed");
                AttemptOutcome::Completed
            }
            Err(StoreError::LockLost(_)) => {
                debug!(job_id = %job.id, "lock lost reporting completion; job handled elsewhere");
                AttemptOutcome::Abandoned
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record completion");
                AttemptOutcome::Abandoned
            }
        },
        Err(ProcessorError::LockLost) => {
            debug!(job_id = %job.id, "processor observed lost lock; abandoning");
            AttemptOutcome::Abandoned
        }
        Err(err) => {
            let error = JobError::processor(err.to_string());
            match job.next_retry() {
                RetryDecision::Retry { delay } => {
                    match store.retry(job.id, worker, error, delay) {
                        Ok(()) => {
                            warn!(
                                job_id = %job.id,
                                queue = %job.queue,
                                attempt = job.attempts_made,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "attempt failed; retry scheduled"
                            );
                            AttemptOutcome::Retried
                        }
                        Err(StoreError::LockLost(_)) => AttemptOutcome::Abandoned,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "failed to schedule retry");
                            AttemptOutcome::Abandoned
                        }
                    }
                }
                RetryDecision::Fail => match store.fail(job.id, worker, error) {
                    Ok(()) => {
                        warn!(
                            job_id = %job.id,
                            queue = %job.queue,
                            attempts = job.attempts_made,
                            error = %err,
                            "retry budget exhausted; job failed"
                        );
                        AttemptOutcome::Failed
                    }
                    Err(StoreError::LockLost(_)) => AttemptOutcome::Abandoned,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "failed to record failure");
                        AttemptOutcome::Abandoned
                    }
                },
            }
        }
    }
}

/// Renews every in-flight lock at the heartbeat cadence. Keeps running
/// through drain so slow processors are not stolen by the stall monitor
/// while they finish.
fn heartbeat_loop(
    store: Arc<dyn JobStore>,
    config: WorkerPoolConfig,
    stopping: Arc<AtomicBool>,
    in_flight: InFlightMap,
) {
    let cadence = config.heartbeat_interval();
    let tick = Duration::from_millis(20).min(cadence);
    let mut last_renewal = Instant::now();

    loop {
        if stopping.load(Ordering::SeqCst) && in_flight.lock().unwrap().is_empty() {
            break;
        }
        thread::sleep(tick);
        if last_renewal.elapsed() < cadence {
            continue;
        }
        last_renewal = Instant::now();

        let entries: Vec<(JobId, WorkerId, Arc<AtomicBool>)> = in_flight
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.worker, entry.abandoned.clone()))
            .collect();

        for (job_id, worker, abandoned) in entries {
            match store.heartbeat(job_id, worker, config.lock_duration) {
                Ok(()) => {}
                Err(StoreError::LockLost(_)) => {
                    debug!(job_id = %job_id, "lock lost on heartbeat; abandoning job");
                    abandoned.store(true, Ordering::SeqCst);
                    in_flight.lock().unwrap().remove(&job_id);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "heartbeat failed; retrying next cadence");
                }
            }
        }
    }
}

fn sleep_interruptible(stopping: &AtomicBool, interval: Duration) {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline && !stopping.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(10).min(interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportsmith_core::{BackoffPolicy, JobErrorKind, JobState};
    use reportsmith_store::InMemoryJobStore;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicU32;

    fn fast_config(concurrency: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_concurrency(concurrency)
            .with_poll_interval(Duration::from_millis(10))
            .with_lock_duration(Duration::from_secs(5))
            .with_name("test")
    }

    fn enqueue(store: &Arc<InMemoryJobStore>, queue: QueueName, job: Job) -> JobId {
        store.push_ready(job).unwrap_or_else(|e| panic!("enqueue on {queue}: {e}"))
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
    fn pool_completes_enqueued_jobs() {
        let store = InMemoryJobStore::arc();
        let mut ids = Vec::new();
        for i in 0..4 {
            let job = Job::new(QueueName::Reports, json!({"i": i}), chrono::Utc::now());
            ids.push(enqueue(&store, QueueName::Reports, job));
        }

        let processor = Arc::new(|payload: &Value, ctx: &mut dyn JobContext| {
            ctx.set_progress(100)?;
            Ok(json!({"echo": payload.clone()}))
        });
        let pool = WorkerPool::new(store.clone(), QueueName::Reports, processor);
        let handle = pool.spawn(fast_config(2));

        assert!(wait_for(Duration::from_secs(5), || {
            handle.stats().jobs_completed == 4
        }));
        handle.shutdown();

        for id in ids {
            let job = store.get(id).unwrap().unwrap();
            assert_eq!(job.state, JobState::Completed);
            assert_eq!(job.progress, 100);
            assert_eq!(job.attempts_made, 1);
        }
    }

    #[test]
    fn failing_job_is_retried_then_failed() {
        let store = InMemoryJobStore::arc();
        let job = Job::new(QueueName::Files, json!({}), chrono::Utc::now())
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::new(Duration::from_millis(20), 2));
        let id = enqueue(&store, QueueName::Files, job);

        let processor = Arc::new(|_: &Value, _: &mut dyn JobContext| {
            Err(ProcessorError::execution("always broken"))
        });
        let handle =
            WorkerPool::new(store.clone(), QueueName::Files, processor).spawn(fast_config(1));

        assert!(wait_for(Duration::from_secs(5), || {
            handle.stats().jobs_failed == 1
        }));
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_retried, 1);
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.last_error.unwrap().kind, JobErrorKind::Processor);
    }

    #[test]
    fn concurrency_is_bounded() {
        let store = InMemoryJobStore::arc();
        for i in 0..6 {
            let job = Job::new(QueueName::Sync, json!({"i": i}), chrono::Utc::now());
            enqueue(&store, QueueName::Sync, job);
        }

        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let processor = {
            let running = running.clone();
            let peak = peak.clone();
            Arc::new(move |_: &Value, _: &mut dyn JobContext| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            })
        };

        let handle = WorkerPool::new(store.clone(), QueueName::Sync, processor).spawn(fast_config(2));
        assert!(wait_for(Duration::from_secs(5), || {
            handle.stats().jobs_completed == 6
        }));
        handle.shutdown();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn drain_waits_for_in_flight_work() {
        let store = InMemoryJobStore::arc();
        let job = Job::new(QueueName::Emails, json!({"to": "a@b.com"}), chrono::Utc::now());
        let id = enqueue(&store, QueueName::Emails, job);

        let processor = Arc::new(|_: &Value, _: &mut dyn JobContext| {
            thread::sleep(Duration::from_millis(200));
            Ok(json!({"delivered": true}))
        });
        let handle =
            WorkerPool::new(store.clone(), QueueName::Emails, processor).spawn(fast_config(1));

        assert!(wait_for(Duration::from_secs(2), || {
            handle.stats().in_flight == 1
        }));
        handle.drain(Duration::from_secs(2)).unwrap();

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);

        // No claiming after drain: a late job stays waiting.
        let late = Job::new(QueueName::Emails, json!({}), chrono::Utc::now());
        let late_id = enqueue(&store, QueueName::Emails, late);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            store.get(late_id).unwrap().unwrap().state,
            JobState::Waiting
        );
    }

    #[test]
    fn drain_times_out_on_stuck_processor() {
        let store = InMemoryJobStore::arc();
        let job = Job::new(QueueName::Maintenance, json!({}), chrono::Utc::now());
        enqueue(&store, QueueName::Maintenance, job);

        let processor = Arc::new(|_: &Value, _: &mut dyn JobContext| {
            thread::sleep(Duration::from_secs(30));
            Ok(json!(null))
        });
        let handle = WorkerPool::new(store.clone(), QueueName::Maintenance, processor)
            .spawn(fast_config(1));

        assert!(wait_for(Duration::from_secs(2), || {
            handle.stats().in_flight == 1
        }));
        assert!(handle.drain(Duration::from_millis(100)).is_err());
    }
}
