//! Typed front door for one lane of work.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use reportsmith_core::{
    BackoffPolicy, Clock, Job, JobId, JobStatus, QueueName, SystemClock,
};
use reportsmith_store::{JobStore, QueueStats, StoreError};

/// Per-queue defaults, fixed at construction and applied to every job
/// unless overridden at enqueue time.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub default_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            default_backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-job overrides accepted at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    /// Initial delay before the job becomes claimable.
    pub delay: Option<Duration>,
}

/// Enqueue-time failure, surfaced synchronously to the producer.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The payload was rejected before any job was created.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EnqueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => EnqueueError::InvalidPayload(msg),
            other => EnqueueError::Store(other),
        }
    }
}

/// One named lane of jobs sharing retry defaults.
pub struct Queue {
    name: QueueName,
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub fn new(name: QueueName, store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self::with_clock(name, store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: QueueName,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            store,
            config,
            clock,
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Persist a new job. It becomes visible to workers immediately, or
    /// after `options.delay` when one is given.
    pub fn enqueue<P: Serialize>(
        &self,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| EnqueueError::InvalidPayload(e.to_string()))?;

        let now = self.clock.now();
        let mut job = Job::new(self.name, payload, now)
            .with_max_attempts(
                options
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts),
            )
            .with_backoff(options.backoff.unwrap_or(self.config.default_backoff));
        if let Some(delay) = options.delay {
            job = job.delayed_until(now + chrono::Duration::from_std(delay).unwrap_or_default());
        }

        let job_id = self.store.push_ready(job)?;
        debug!(queue = %self.name, job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Read-only state snapshot. Never mutates.
    pub fn status(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.store.get(job_id)?.map(|job| job.status()))
    }

    /// Occupancy counters for this lane.
    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportsmith_core::{JobState, ManualClock, WorkerId};
    use reportsmith_store::InMemoryJobStore;
    use serde_json::json;

    fn queue_with_clock() -> (Queue, Arc<ManualClock>, Arc<InMemoryJobStore>) {
        let clock = Arc::new(ManualClock::from_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let queue = Queue::with_clock(
            QueueName::Emails,
            store.clone(),
            QueueConfig::default(),
            clock.clone(),
        );
        (queue, clock, store)
    }

    #[test]
    fn enqueue_applies_queue_defaults() {
        let (queue, _, store) = queue_with_clock();

        let job_id = queue
            .enqueue(&json!({"to": "a@b.com"}), EnqueueOptions::default())
            .unwrap();

        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff, BackoffPolicy::default());
        assert_eq!(job.state, JobState::Waiting);
    }

    #[test]
    fn enqueue_options_override_defaults() {
        let (queue, clock, store) = queue_with_clock();

        let job_id = queue
            .enqueue(
                &json!({"to": "a@b.com"}),
                EnqueueOptions {
                    max_attempts: Some(2),
                    backoff: Some(BackoffPolicy::new(Duration::from_secs(1), 3)),
                    delay: Some(Duration::from_secs(60)),
                },
            )
            .unwrap();

        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.max_attempts, 2);
        assert_eq!(job.backoff.multiplier, 3);
        assert!(!job.is_ready(clock.now()));
        clock.advance(Duration::from_secs(60));
        assert!(job.is_ready(clock.now()));
    }

    #[test]
    fn non_serializable_payload_is_rejected_synchronously() {
        struct Unserializable;
        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("refused"))
            }
        }

        let (queue, _, store) = queue_with_clock();

        let result = queue.enqueue(&Unserializable, EnqueueOptions::default());
        assert!(matches!(result, Err(EnqueueError::InvalidPayload(_))));

        // No job was created.
        assert_eq!(store.stats(QueueName::Emails).unwrap(), QueueStats::default());
    }

    #[test]
    fn status_is_a_read_only_snapshot() {
        let (queue, _, store) = queue_with_clock();
        let job_id = queue
            .enqueue(&json!({"to": "a@b.com"}), EnqueueOptions::default())
            .unwrap();

        let before = store.get(job_id).unwrap().unwrap();
        let status = queue.status(job_id).unwrap().unwrap();
        assert_eq!(status.attempts_made, 0);
        assert_eq!(status.state, JobState::Waiting);
        assert_eq!(store.get(job_id).unwrap().unwrap(), before);

        store
            .claim_next(QueueName::Emails, WorkerId::new(), Duration::from_secs(30))
            .unwrap()
            .unwrap();
        let status = queue.status(job_id).unwrap().unwrap();
        assert_eq!(status.attempts_made, 1);
        assert!(status.state.is_active());
    }
}
