//! Redis-backed job store (durable, shared across worker processes).
//!
//! ## Key layout
//!
//! - `{ns}:{queue}:ready` — list of job ids claimable now (FIFO)
//! - `{ns}:{queue}:delayed` — zset of job ids scored by not-before time
//! - `{ns}:{queue}:active` — zset of job ids scored by lock deadline
//! - `{ns}:{queue}:counters` — completed/failed counters
//! - `{ns}:job:{id}` — hash of job fields
//! - `{ns}:job:{id}:logs` — list of worker log lines
//!
//! Every transition that touches more than one key runs as a Lua script,
//! so the claim/ownership contract holds across any number of worker
//! processes sharing the instance. Terminal jobs are expired by Redis TTL
//! after the retention window rather than swept by `purge_expired`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use reportsmith_core::{
    BackoffPolicy, Clock, Job, JobError, JobId, JobState, QueueName, SystemClock, WorkerId,
};

use crate::contract::{JobStore, QueueStats, ReclaimOutcome, StoreError};

const DEFAULT_NAMESPACE: &str = "reportsmith";

/// How long terminal jobs stay readable before Redis expires them.
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
local id = redis.call('LPOP', KEYS[1])
if not id then return false end
local jk = ARGV[4] .. id
redis.call('ZADD', KEYS[3], ARGV[2], id)
redis.call('HSET', jk, 'state', 'active', 'lock_owner', ARGV[3],
  'lock_expires_at_ms', ARGV[2], 'updated_at_ms', ARGV[1])
redis.call('HDEL', jk, 'scheduled_at_ms')
redis.call('HINCRBY', jk, 'attempts_made', 1)
return {id, redis.call('HGETALL', jk)}
"#;

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], 'state') ~= 'active'
   or redis.call('HGET', KEYS[2], 'lock_owner') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[2], 'lock_expires_at_ms', ARGV[3], 'updated_at_ms', ARGV[4])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], 'state') ~= 'active'
   or redis.call('HGET', KEYS[2], 'lock_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'state', 'completed', 'result', ARGV[3], 'updated_at_ms', ARGV[4])
redis.call('HDEL', KEYS[2], 'lock_owner', 'lock_expires_at_ms', 'last_error')
redis.call('HINCRBY', KEYS[4], 'completed', 1)
redis.call('PEXPIRE', KEYS[2], ARGV[5])
redis.call('PEXPIRE', KEYS[3], ARGV[5])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active'
   or redis.call('HGET', KEYS[3], 'lock_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'waiting', 'last_error', ARGV[3],
  'scheduled_at_ms', ARGV[4], 'updated_at_ms', ARGV[5])
redis.call('HDEL', KEYS[3], 'lock_owner', 'lock_expires_at_ms')
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], 'state') ~= 'active'
   or redis.call('HGET', KEYS[2], 'lock_owner') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'state', 'failed', 'last_error', ARGV[3], 'updated_at_ms', ARGV[4])
redis.call('HDEL', KEYS[2], 'lock_owner', 'lock_expires_at_ms')
redis.call('HINCRBY', KEYS[4], 'failed', 1)
redis.call('PEXPIRE', KEYS[2], ARGV[5])
redis.call('PEXPIRE', KEYS[3], ARGV[5])
return 1
"#;

const SET_PROGRESS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active'
   or redis.call('HGET', KEYS[1], 'lock_owner') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'progress', ARGV[2], 'updated_at_ms', ARGV[3])
return 1
"#;

const APPEND_LOG_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active'
   or redis.call('HGET', KEYS[1], 'lock_owner') ~= ARGV[1] then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[2])
redis.call('HSET', KEYS[1], 'updated_at_ms', ARGV[3])
return 1
"#;

const RECLAIM_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active' then return 'skipped' end
local exp = tonumber(redis.call('HGET', KEYS[3], 'lock_expires_at_ms') or '0')
if exp >= tonumber(ARGV[2]) then return 'skipped' end
local stalls = redis.call('HINCRBY', KEYS[3], 'stalled_count', 1)
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], 'lock_owner', 'lock_expires_at_ms', 'scheduled_at_ms')
if stalls > tonumber(ARGV[3]) then
  redis.call('HSET', KEYS[3], 'state', 'failed', 'last_error', ARGV[4], 'updated_at_ms', ARGV[2])
  redis.call('HINCRBY', KEYS[5], 'failed', 1)
  redis.call('PEXPIRE', KEYS[3], ARGV[5])
  redis.call('PEXPIRE', KEYS[4], ARGV[5])
  return 'failed'
end
redis.call('HSET', KEYS[3], 'state', 'waiting', 'updated_at_ms', ARGV[2])
redis.call('RPUSH', KEYS[1], ARGV[1])
return 'requeued'
"#;

struct Scripts {
    claim: redis::Script,
    heartbeat: redis::Script,
    complete: redis::Script,
    retry: redis::Script,
    fail: redis::Script,
    set_progress: redis::Script,
    append_log: redis::Script,
    reclaim: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            claim: redis::Script::new(CLAIM_SCRIPT),
            heartbeat: redis::Script::new(HEARTBEAT_SCRIPT),
            complete: redis::Script::new(COMPLETE_SCRIPT),
            retry: redis::Script::new(RETRY_SCRIPT),
            fail: redis::Script::new(FAIL_SCRIPT),
            set_progress: redis::Script::new(SET_PROGRESS_SCRIPT),
            append_log: redis::Script::new(APPEND_LOG_SCRIPT),
            reclaim: redis::Script::new(RECLAIM_SCRIPT),
        }
    }
}

/// A `JobStore` backed by a single Redis instance.
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    namespace: String,
    retention: Duration,
    clock: Arc<dyn Clock>,
    scripts: Scripts,
}

impl RedisJobStore {
    /// Connect with the default namespace and retention.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            namespace: DEFAULT_NAMESPACE.to_string(),
            retention: DEFAULT_RETENTION,
            clock: Arc::new(SystemClock),
            scripts: Scripts::new(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// How long completed/failed jobs stay readable before Redis expires
    /// them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn ready_key(&self, queue: QueueName) -> String {
        format!("{}:{}:ready", self.namespace, queue)
    }

    fn delayed_key(&self, queue: QueueName) -> String {
        format!("{}:{}:delayed", self.namespace, queue)
    }

    fn active_key(&self, queue: QueueName) -> String {
        format!("{}:{}:active", self.namespace, queue)
    }

    fn counters_key(&self, queue: QueueName) -> String {
        format!("{}:{}:counters", self.namespace, queue)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    fn logs_key(&self, job_id: JobId) -> String {
        format!("{}:job:{}:logs", self.namespace, job_id)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn retention_ms(&self) -> i64 {
        self.retention.as_millis() as i64
    }

    /// Look up the queue of a job without loading the whole hash. Needed
    /// because single-job operations address per-queue keys.
    fn queue_of(&self, conn: &mut redis::Connection, job_id: JobId) -> Result<QueueName, StoreError> {
        let queue: Option<String> = redis::cmd("HGET")
            .arg(self.job_key(job_id))
            .arg("queue")
            .query(conn)
            .map_err(|e| StoreError::Storage(format!("HGET failed: {e}")))?;
        queue
            .ok_or(StoreError::NotFound(job_id))?
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored queue name: {e}")))
    }

    /// Run an ownership-conditioned script that returns 1 on success and
    /// 0 when the lock has moved.
    fn owner_guarded(&self, job_id: JobId, outcome: i64) -> Result<(), StoreError> {
        if outcome == 1 {
            Ok(())
        } else {
            Err(StoreError::LockLost(job_id))
        }
    }
}

impl JobStore for RedisJobStore {
    fn push_ready(&self, job: Job) -> Result<JobId, StoreError> {
        let mut conn = self.conn()?;
        let id = job.id;
        let fields = job_to_fields(&job)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let hset = pipe.cmd("HSET");
            hset.arg(self.job_key(id));
            for (field, value) in &fields {
                hset.arg(*field).arg(value);
            }
        }
        match job.scheduled_at {
            Some(at) => {
                pipe.cmd("ZADD")
                    .arg(self.delayed_key(job.queue))
                    .arg(at.timestamp_millis())
                    .arg(id.to_string());
            }
            None => {
                pipe.cmd("RPUSH")
                    .arg(self.ready_key(job.queue))
                    .arg(id.to_string());
            }
        }
        pipe.query::<()>(&mut conn)
            .map_err(|e| StoreError::Storage(format!("enqueue pipeline failed: {e}")))?;

        debug!(job_id = %id, queue = %job.queue, "job persisted");
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn()?;
        let (fields, logs): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("HGETALL")
            .arg(self.job_key(job_id))
            .cmd("LRANGE")
            .arg(self.logs_key(job_id))
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(|e| StoreError::Storage(format!("get pipeline failed: {e}")))?;

        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(job_id, &fields, logs).map(Some)
    }

    fn claim_next(
        &self,
        queue: QueueName,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn()?;
        let now = self.now_ms();
        let expires = now + lock_duration.as_millis() as i64;

        let claimed: Option<(String, Vec<String>)> = self
            .scripts
            .claim
            .key(self.ready_key(queue))
            .key(self.delayed_key(queue))
            .key(self.active_key(queue))
            .arg(now)
            .arg(expires)
            .arg(worker.to_string())
            .arg(self.job_key_prefix())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("claim script failed: {e}")))?;

        let Some((id, flat_fields)) = claimed else {
            return Ok(None);
        };
        let job_id: JobId = id
            .parse()
            .map_err(|e| StoreError::Serialization(format!("claimed job id: {e}")))?;
        let fields: HashMap<String, String> = flat_fields
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        // Log lines are not loaded on the claim path; workers only append.
        job_from_fields(job_id, &fields, Vec::new()).map(Some)
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lock_duration: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let queue = self.queue_of(&mut conn, job_id)?;
        let now = self.now_ms();
        let expires = now + lock_duration.as_millis() as i64;

        let outcome: i64 = self
            .scripts
            .heartbeat
            .key(self.active_key(queue))
            .key(self.job_key(job_id))
            .arg(job_id.to_string())
            .arg(worker.to_string())
            .arg(expires)
            .arg(now)
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("heartbeat script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn complete(&self, job_id: JobId, worker: WorkerId, result: Value) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let queue = self.queue_of(&mut conn, job_id)?;
        let result_json = serde_json::to_string(&result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome: i64 = self
            .scripts
            .complete
            .key(self.active_key(queue))
            .key(self.job_key(job_id))
            .key(self.logs_key(job_id))
            .key(self.counters_key(queue))
            .arg(job_id.to_string())
            .arg(worker.to_string())
            .arg(result_json)
            .arg(self.now_ms())
            .arg(self.retention_ms())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("complete script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: JobError,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let queue = self.queue_of(&mut conn, job_id)?;
        let error_json =
            serde_json::to_string(&error).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = self.now_ms();
        let ready_at = now + delay.as_millis() as i64;

        let outcome: i64 = self
            .scripts
            .retry
            .key(self.active_key(queue))
            .key(self.delayed_key(queue))
            .key(self.job_key(job_id))
            .arg(job_id.to_string())
            .arg(worker.to_string())
            .arg(error_json)
            .arg(ready_at)
            .arg(now)
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("retry script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn fail(&self, job_id: JobId, worker: WorkerId, error: JobError) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let queue = self.queue_of(&mut conn, job_id)?;
        let error_json =
            serde_json::to_string(&error).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome: i64 = self
            .scripts
            .fail
            .key(self.active_key(queue))
            .key(self.job_key(job_id))
            .key(self.logs_key(job_id))
            .key(self.counters_key(queue))
            .arg(job_id.to_string())
            .arg(worker.to_string())
            .arg(error_json)
            .arg(self.now_ms())
            .arg(self.retention_ms())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("fail script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn set_progress(
        &self,
        job_id: JobId,
        worker: WorkerId,
        progress: u8,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let outcome: i64 = self
            .scripts
            .set_progress
            .key(self.job_key(job_id))
            .arg(worker.to_string())
            .arg(progress.min(100))
            .arg(self.now_ms())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("progress script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn append_log(&self, job_id: JobId, worker: WorkerId, line: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let outcome: i64 = self
            .scripts
            .append_log
            .key(self.job_key(job_id))
            .key(self.logs_key(job_id))
            .arg(worker.to_string())
            .arg(line)
            .arg(self.now_ms())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("log script failed: {e}")))?;
        self.owner_guarded(job_id, outcome)
    }

    fn list_stalled(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.active_key(queue))
            .arg("-inf")
            .arg(format!("({}", now.timestamp_millis()))
            .query(&mut conn)
            .map_err(|e| StoreError::Storage(format!("ZRANGEBYSCORE failed: {e}")))?;

        let mut stalled = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id: JobId = match id.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.job_key(job_id))
                .query(&mut conn)
                .map_err(|e| StoreError::Storage(format!("HGETALL failed: {e}")))?;
            if fields.is_empty() {
                continue;
            }
            stalled.push(job_from_fields(job_id, &fields, Vec::new())?);
        }
        Ok(stalled)
    }

    fn reclaim(&self, job_id: JobId, stall_cap: u32) -> Result<ReclaimOutcome, StoreError> {
        let mut conn = self.conn()?;
        let queue = self.queue_of(&mut conn, job_id)?;
        // The script increments by exactly one per reclaim, so when it
        // crosses the cap the count is cap + 1.
        let stalled_error = serde_json::to_string(&JobError::stalled(stall_cap + 1))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome: String = self
            .scripts
            .reclaim
            .key(self.ready_key(queue))
            .key(self.active_key(queue))
            .key(self.job_key(job_id))
            .key(self.logs_key(job_id))
            .key(self.counters_key(queue))
            .arg(job_id.to_string())
            .arg(self.now_ms())
            .arg(stall_cap)
            .arg(stalled_error)
            .arg(self.retention_ms())
            .invoke(&mut conn)
            .map_err(|e| StoreError::Storage(format!("reclaim script failed: {e}")))?;

        match outcome.as_str() {
            "requeued" => Ok(ReclaimOutcome::Requeued),
            "failed" => Ok(ReclaimOutcome::Failed),
            "skipped" => Ok(ReclaimOutcome::Skipped),
            other => Err(StoreError::Storage(format!(
                "unexpected reclaim outcome: {other}"
            ))),
        }
    }

    fn stats(&self, queue: QueueName) -> Result<QueueStats, StoreError> {
        let mut conn = self.conn()?;
        let (waiting, delayed, active, completed, failed): (
            usize,
            usize,
            usize,
            Option<usize>,
            Option<usize>,
        ) = redis::pipe()
            .cmd("LLEN")
            .arg(self.ready_key(queue))
            .cmd("ZCARD")
            .arg(self.delayed_key(queue))
            .cmd("ZCARD")
            .arg(self.active_key(queue))
            .cmd("HGET")
            .arg(self.counters_key(queue))
            .arg("completed")
            .cmd("HGET")
            .arg(self.counters_key(queue))
            .arg("failed")
            .query(&mut conn)
            .map_err(|e| StoreError::Storage(format!("stats pipeline failed: {e}")))?;

        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    fn purge_expired(&self, _retention: Duration) -> Result<usize, StoreError> {
        // Terminal jobs carry a TTL set at the terminal transition; Redis
        // expires them without a sweep.
        Ok(0)
    }
}

fn job_to_fields(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    let payload = serde_json::to_string(&job.payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut fields = vec![
        ("queue", job.queue.as_str().to_string()),
        ("payload", payload),
        ("state", "waiting".to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        (
            "backoff_base_ms",
            (job.backoff.base_delay.as_millis() as u64).to_string(),
        ),
        ("backoff_multiplier", job.backoff.multiplier.to_string()),
        ("progress", job.progress.to_string()),
        ("stalled_count", job.stalled_count.to_string()),
        ("created_at_ms", job.created_at.timestamp_millis().to_string()),
        ("updated_at_ms", job.updated_at.timestamp_millis().to_string()),
    ];
    if let Some(at) = job.scheduled_at {
        fields.push(("scheduled_at_ms", at.timestamp_millis().to_string()));
    }
    Ok(fields)
}

fn job_from_fields(
    job_id: JobId,
    fields: &HashMap<String, String>,
    logs: Vec<String>,
) -> Result<Job, StoreError> {
    let field = |name: &str| -> Result<&String, StoreError> {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Serialization(format!("job {job_id} missing field {name}")))
    };
    let parse_u32 = |name: &str| -> Result<u32, StoreError> {
        field(name)?
            .parse()
            .map_err(|e| StoreError::Serialization(format!("field {name}: {e}")))
    };
    let parse_ms = |raw: &str, name: &str| -> Result<DateTime<Utc>, StoreError> {
        let ms: i64 = raw
            .parse()
            .map_err(|e| StoreError::Serialization(format!("field {name}: {e}")))?;
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| StoreError::Serialization(format!("field {name}: bad timestamp {ms}")))
    };

    let queue: QueueName = field("queue")?
        .parse()
        .map_err(|e| StoreError::Serialization(format!("field queue: {e}")))?;
    let payload: Value = serde_json::from_str(field("payload")?)
        .map_err(|e| StoreError::Serialization(format!("field payload: {e}")))?;

    let state = match field("state")?.as_str() {
        "waiting" => JobState::Waiting,
        "active" => {
            let lock_owner: WorkerId = field("lock_owner")?
                .parse()
                .map_err(|e| StoreError::Serialization(format!("field lock_owner: {e}")))?;
            let lock_expires_at = parse_ms(field("lock_expires_at_ms")?, "lock_expires_at_ms")?;
            JobState::Active {
                lock_owner,
                lock_expires_at,
            }
        }
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        other => {
            return Err(StoreError::Serialization(format!(
                "job {job_id} has unknown state {other}"
            )));
        }
    };

    let result = fields
        .get("result")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("field result: {e}")))?;
    let last_error = fields
        .get("last_error")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("field last_error: {e}")))?;
    let scheduled_at = fields
        .get("scheduled_at_ms")
        .map(|raw| parse_ms(raw, "scheduled_at_ms"))
        .transpose()?;

    let backoff_base_ms: u64 = field("backoff_base_ms")?
        .parse()
        .map_err(|e| StoreError::Serialization(format!("field backoff_base_ms: {e}")))?;

    Ok(Job {
        id: job_id,
        queue,
        payload,
        state,
        attempts_made: parse_u32("attempts_made")?,
        max_attempts: parse_u32("max_attempts")?,
        backoff: BackoffPolicy::new(
            Duration::from_millis(backoff_base_ms),
            parse_u32("backoff_multiplier")?,
        ),
        progress: parse_u32("progress")?.min(100) as u8,
        logs,
        result,
        last_error,
        stalled_count: parse_u32("stalled_count")?,
        created_at: parse_ms(field("created_at_ms")?, "created_at_ms")?,
        updated_at: parse_ms(field("updated_at_ms")?, "updated_at_ms")?,
        scheduled_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_mapping_round_trips() {
        let now = Utc::now();
        let job = Job::new(QueueName::Reports, json!({"template": "weekly"}), now)
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(10), 3))
            .delayed_until(now + chrono::Duration::seconds(5));

        let fields: HashMap<String, String> = job_to_fields(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = job_from_fields(job.id, &fields, Vec::new()).unwrap();

        assert_eq!(restored.queue, job.queue);
        assert_eq!(restored.payload, job.payload);
        assert_eq!(restored.state, JobState::Waiting);
        assert_eq!(restored.max_attempts, 3);
        assert_eq!(restored.backoff, job.backoff);
        assert_eq!(
            restored.scheduled_at.map(|t| t.timestamp_millis()),
            job.scheduled_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn missing_fields_surface_as_serialization_errors() {
        let fields = HashMap::from([("queue".to_string(), "reports".to_string())]);
        assert!(matches!(
            job_from_fields(JobId::new(), &fields, Vec::new()),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn key_layout_is_namespaced() {
        let store = RedisJobStore::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_namespace("testns");
        let id = JobId::new();

        assert_eq!(store.ready_key(QueueName::Emails), "testns:emails:ready");
        assert_eq!(store.delayed_key(QueueName::Sync), "testns:sync:delayed");
        assert_eq!(store.active_key(QueueName::Files), "testns:files:active");
        assert_eq!(store.job_key(id), format!("testns:job:{id}"));
        assert_eq!(store.logs_key(id), format!("testns:job:{id}:logs"));
    }
}
