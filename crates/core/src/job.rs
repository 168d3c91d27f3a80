//! The job model and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::id::{JobId, WorkerId};
use crate::policy::{BackoffPolicy, RetryDecision};
use crate::queue::QueueName;

/// Where a job is in its lifecycle.
///
/// `waiting → active → {completed | waiting (retry) | failed}`. Only the
/// `Active` variant carries lock data; terminal states are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active {
        lock_owner: WorkerId,
        lock_expires_at: DateTime<Utc>,
    },
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Active { .. })
    }

    /// The current lock owner, if any.
    pub fn lock_owner(&self) -> Option<WorkerId> {
        match self {
            JobState::Active { lock_owner, .. } => Some(*lock_owner),
            _ => None,
        }
    }

    /// The current lock deadline, if any.
    pub fn lock_expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Active {
                lock_expires_at, ..
            } => Some(*lock_expires_at),
            _ => None,
        }
    }
}

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, assigned at enqueue time.
    pub id: JobId,
    /// The lane this job belongs to. Never changes.
    pub queue: QueueName,
    /// Opaque data interpreted only by the matching processor.
    pub payload: Value,
    /// Lifecycle state, including lock data while active.
    pub state: JobState,
    /// Execution attempts started so far. Incremented when a worker claims
    /// the job, never by a stall reclaim.
    pub attempts_made: u32,
    /// Retry budget, >= 1, fixed at enqueue time.
    pub max_attempts: u32,
    /// Backoff configuration, fixed at enqueue time.
    pub backoff: BackoffPolicy,
    /// 0-100, written only by the owning worker; survives failed attempts.
    pub progress: u8,
    /// Append-only log lines written by the owning worker.
    pub logs: Vec<String>,
    /// Set exactly once, on transition to `Completed`.
    pub result: Option<Value>,
    /// Most recent failure. Cleared on completion.
    pub last_error: Option<JobError>,
    /// Times the stall monitor reclaimed this job from a dead worker.
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not-before time for delayed and retried jobs.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a waiting job with the default retry policy.
    pub fn new(queue: QueueName, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            progress: 0,
            logs: Vec::new(),
            result: None,
            last_error: None,
            stalled_count: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
        }
    }

    /// Override the retry budget. Clamped to at least one attempt.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Make the job invisible to claimers until `at`.
    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether a claimer may take this job at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Waiting {
            return false;
        }
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// `Waiting → Active`: stamp the lock and count the execution attempt.
    pub fn begin_attempt(
        &mut self,
        lock_owner: WorkerId,
        lock_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Active {
            lock_owner,
            lock_expires_at,
        };
        self.attempts_made += 1;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Extend the current lock deadline (heartbeat).
    pub fn renew_lock(&mut self, lock_expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        if let JobState::Active {
            lock_expires_at: deadline,
            ..
        } = &mut self.state
        {
            *deadline = lock_expires_at;
            self.updated_at = now;
        }
    }

    /// `Active → Completed`. Sets the result; a completed job retains no
    /// error from earlier attempts.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.last_error = None;
        self.updated_at = now;
    }

    /// `Active → Waiting` with a not-before time. Progress and logs are
    /// preserved for observability; only state, error, and schedule change.
    pub fn retry(&mut self, error: JobError, not_before: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.last_error = Some(error);
        self.scheduled_at = Some(not_before);
        self.updated_at = now;
    }

    /// `Active → Failed`, terminal.
    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// `Active → Waiting` after a stall, without touching `attempts_made`:
    /// a stall is a worker crash, not an application failure.
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.stalled_count += 1;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Whether `worker` currently owns this job's lock.
    pub fn is_owned_by(&self, worker: WorkerId) -> bool {
        self.state.lock_owner() == Some(worker)
    }

    /// What to do now that the current attempt has failed.
    pub fn next_retry(&self) -> RetryDecision {
        if self.attempts_made >= self.max_attempts {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry {
                delay: self.backoff.delay_for_attempt(self.attempts_made),
            }
        }
    }

    /// Read-only snapshot for status queries.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            queue: self.queue,
            state: self.state.clone(),
            progress: self.progress,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

/// What status pollers (UIs, CLIs) see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub queue: QueueName,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<JobError>,
    pub result: Option<Value>,
}
