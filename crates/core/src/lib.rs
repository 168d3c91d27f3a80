//! `reportsmith-core` — domain model for the job subsystem.
//!
//! This crate contains the **pure domain** of the queue engine (no
//! infrastructure concerns): identifiers, the job state machine, retry
//! policies, and the error taxonomy shared by stores and workers.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod policy;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, JobErrorKind, ParseError};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobState, JobStatus};
pub use policy::{BackoffPolicy, RetryDecision};
pub use queue::QueueName;
