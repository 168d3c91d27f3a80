//! The durable store contract consumed by the queue engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use reportsmith_core::{Job, JobError, JobId, QueueName, WorkerId};

/// Storage-level error.
///
/// `LockLost` is the load-bearing variant: every mutation of an active job
/// is conditioned on current lock ownership, and a caller that receives it
/// must abandon the job silently (another owner has it now).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("lock lost for job {0}")]
    LockLost(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// What `reclaim` did with a stalled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Lock cleared, job back in the waiting set. `attempts_made` untouched.
    Requeued,
    /// Reclaimed past the stall cap; job moved to terminal failure with
    /// kind `StalledTooManyTimes`.
    Failed,
    /// The job was no longer stalled (already reclaimed, re-locked, or
    /// finished). Running the sweep twice is a no-op the second time.
    Skipped,
}

/// Per-queue occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Waiting and claimable now.
    pub waiting: usize,
    /// Waiting but gated by a scheduled-not-before time.
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Atomic job storage.
///
/// Every operation is atomic with respect to concurrent callers, and every
/// mutation of an active job checks that the caller still owns the lock.
/// Multiple worker processes may share one store; the claim operation is
/// the only arbiter of ownership.
pub trait JobStore: Send + Sync {
    /// Persist a new waiting job. It becomes visible to claimers
    /// immediately, or at its `scheduled_at` if one is set.
    fn push_ready(&self, job: Job) -> Result<JobId, StoreError>;

    /// Read-only snapshot of a job. Never mutates.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically move the oldest ready job of `queue` to active, stamping
    /// `worker` as lock owner with a deadline of now + `lock_duration` and
    /// counting the execution attempt. `None` when nothing is ready.
    fn claim_next(
        &self,
        queue: QueueName,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend the lock deadline by `lock_duration` from now.
    fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<(), StoreError>;

    /// `Active → Completed` with a result. Owner-only.
    fn complete(&self, job_id: JobId, worker: WorkerId, result: Value) -> Result<(), StoreError>;

    /// `Active → Waiting`, claimable again after `delay`. Owner-only.
    fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: JobError,
        delay: Duration,
    ) -> Result<(), StoreError>;

    /// `Active → Failed`, terminal. Owner-only.
    fn fail(&self, job_id: JobId, worker: WorkerId, error: JobError) -> Result<(), StoreError>;

    /// Record progress (0-100) on an active job. Owner-only.
    fn set_progress(&self, job_id: JobId, worker: WorkerId, progress: u8)
    -> Result<(), StoreError>;

    /// Append a log line to an active job. Owner-only.
    fn append_log(&self, job_id: JobId, worker: WorkerId, line: &str) -> Result<(), StoreError>;

    /// Jobs of `queue` still marked active whose lock deadline has passed.
    fn list_stalled(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Atomically clear an expired lock and return the job to waiting
    /// without touching `attempts_made`. Counts the reclaim; once the job
    /// has been reclaimed more than `stall_cap` times it is failed with
    /// `StalledTooManyTimes` instead of requeued.
    fn reclaim(&self, job_id: JobId, stall_cap: u32) -> Result<ReclaimOutcome, StoreError>;

    /// Occupancy counters for one queue.
    fn stats(&self, queue: QueueName) -> Result<QueueStats, StoreError>;

    /// Remove terminal jobs whose last update is older than `retention`.
    /// Returns how many were removed. Backends with native TTL may expire
    /// terminal jobs themselves and report 0 here.
    fn purge_expired(&self, retention: Duration) -> Result<usize, StoreError>;
}
