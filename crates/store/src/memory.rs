//! In-memory job store for tests and single-process development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use reportsmith_core::{Clock, Job, JobError, JobId, JobState, QueueName, SystemClock, WorkerId};

use crate::contract::{JobStore, QueueStats, ReclaimOutcome, StoreError};

/// A `JobStore` backed by a process-local map.
///
/// Honors the full contract (atomic claims, ownership-conditioned
/// mutations, stall reclaim) but provides no durability across restarts.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use an explicit clock. Lets tests drive lock expiry and scheduled
    /// times without sleeping.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fetch and verify ownership in one step; all owner-only mutations
    /// funnel through this.
    fn with_owned_job<T>(
        &self,
        job_id: JobId,
        worker: WorkerId,
        mutate: impl FnOnce(&mut Job, DateTime<Utc>) -> T,
    ) -> Result<T, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if !job.is_owned_by(worker) {
            return Err(StoreError::LockLost(job_id));
        }
        Ok(mutate(job, now))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn push_ready(&self, job: Job) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    fn claim_next(
        &self,
        queue: QueueName,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();

        // Oldest ready job wins; id breaks created_at ties (ids are v7,
        // so this is still enqueue order).
        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let expires = now + chrono::Duration::from_std(lock_duration).unwrap_or_default();
        job.begin_attempt(worker, expires, now);
        Ok(Some(job.clone()))
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| {
            let expires = now + chrono::Duration::from_std(lock_duration).unwrap_or_default();
            job.renew_lock(expires, now);
        })
    }

    fn complete(&self, job_id: JobId, worker: WorkerId, result: Value) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| job.complete(result, now))
    }

    fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: JobError,
        delay: Duration,
    ) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| {
            let not_before = now + chrono::Duration::from_std(delay).unwrap_or_default();
            job.retry(error, not_before, now);
        })
    }

    fn fail(&self, job_id: JobId, worker: WorkerId, error: JobError) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| job.fail(error, now))
    }

    fn set_progress(
        &self,
        job_id: JobId,
        worker: WorkerId,
        progress: u8,
    ) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| {
            job.progress = progress.min(100);
            job.updated_at = now;
        })
    }

    fn append_log(&self, job_id: JobId, worker: WorkerId, line: &str) -> Result<(), StoreError> {
        self.with_owned_job(job_id, worker, |job, now| {
            job.logs.push(line.to_string());
            job.updated_at = now;
        })
    }

    fn list_stalled(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stalled: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.state
                        .lock_expires_at()
                        .is_some_and(|deadline| deadline < now)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|j| (j.created_at, j.id));
        Ok(stalled)
    }

    fn reclaim(&self, job_id: JobId, stall_cap: u32) -> Result<ReclaimOutcome, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        // Idempotent: only an expired lock is reclaimable. A job already
        // swept back to waiting, re-claimed with a fresh lock, or finished
        // is left alone.
        match job.state.lock_expires_at() {
            Some(deadline) if deadline < now => {}
            _ => return Ok(ReclaimOutcome::Skipped),
        }

        job.reclaim(now);
        if job.stalled_count > stall_cap {
            let stalls = job.stalled_count;
            job.fail(JobError::stalled(stalls), now);
            return Ok(ReclaimOutcome::Failed);
        }
        Ok(ReclaimOutcome::Requeued)
    }

    fn stats(&self, queue: QueueName) -> Result<QueueStats, StoreError> {
        let now = self.clock.now();
        let jobs = self.jobs.read().unwrap();
        let mut stats = QueueStats::default();

        for job in jobs.values().filter(|j| j.queue == queue) {
            match &job.state {
                JobState::Waiting if job.is_ready(now) => stats.waiting += 1,
                JobState::Waiting => stats.delayed += 1,
                JobState::Active { .. } => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    fn purge_expired(&self, retention: Duration) -> Result<usize, StoreError> {
        let cutoff =
            self.clock.now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && j.updated_at < cutoff));
        Ok(before - jobs.len())
    }
}
