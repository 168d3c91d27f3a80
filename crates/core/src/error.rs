//! Error taxonomy for jobs and their inputs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of failure put a job into its current error state.
///
/// Distinguishable for observability/alerting: a `StalledTooManyTimes`
/// terminal failure means workers kept dying on the job, not that the
/// application code rejected it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The processor returned or raised an error.
    Processor,
    /// The stall monitor reclaimed the job past its cap.
    StalledTooManyTimes,
}

impl core::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobErrorKind::Processor => write!(f, "processor"),
            JobErrorKind::StalledTooManyTimes => write!(f, "stalled_too_many_times"),
        }
    }
}

/// The error recorded on a job after a failed attempt or terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn processor(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Processor,
            message: message.into(),
        }
    }

    pub fn stalled(reclaims: u32) -> Self {
        Self {
            kind: JobErrorKind::StalledTooManyTimes,
            message: format!("job stalled and was reclaimed {reclaims} times"),
        }
    }
}

/// Parse failure for identifiers and queue names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid identifier: {0}")]
    Id(String),

    #[error("unknown queue: {0}")]
    Queue(String),
}

impl ParseError {
    pub fn id(msg: impl Into<String>) -> Self {
        Self::Id(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }
}
