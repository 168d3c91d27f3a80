//! The contract between the queue engine and the application's domain
//! functions.

use serde_json::Value;
use thiserror::Error;

use reportsmith_core::JobId;

/// Failure of one execution attempt.
///
/// An `Execution` error feeds the retry state machine. `LockLost` means
/// the job belongs to someone else now; the worker abandons it without
/// reporting anything.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Execution(String),

    #[error("lock lost")]
    LockLost,
}

impl ProcessorError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// A payload the processor cannot deserialize is an ordinary execution
/// failure, subject to the same retry policy as any other error.
impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Execution(format!("malformed payload: {err}"))
    }
}

/// Handle offered to a processor while its job is active.
///
/// Each call is a single atomic store write conditioned on lock
/// ownership; a call that returns `LockLost` means the job has been
/// handed to another owner and the processor should bail out.
pub trait JobContext {
    fn job_id(&self) -> JobId;

    /// Which execution attempt this is (1-indexed).
    fn attempts_made(&self) -> u32;

    /// Record progress, 0-100. Preserved even if this attempt fails.
    fn set_progress(&mut self, progress: u8) -> Result<(), ProcessorError>;

    /// Append a line to the job's log.
    fn append_log(&mut self, line: &str) -> Result<(), ProcessorError>;
}

/// One domain function bound to a queue.
///
/// Invoked at-least-once per logical job: a crashed worker's job is
/// re-executed elsewhere, so side effects must be idempotent (or keyed by
/// an idempotency token in the payload).
pub trait Processor: Send + Sync {
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError>;
}

/// Blanket impl so plain closures can serve as processors in tests and
/// simple wiring.
impl<F> Processor for F
where
    F: Fn(&Value, &mut dyn JobContext) -> Result<Value, ProcessorError> + Send + Sync,
{
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        self(payload, ctx)
    }
}
