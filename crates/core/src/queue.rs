//! The fixed set of queue lanes.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A named lane of work. The set is closed: producers and workers agree on
/// these five lanes at compile time, and a job never changes lanes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Report generation (render + assemble a report document).
    Reports,
    /// Outbound email delivery.
    Emails,
    /// External-data synchronization runs.
    Sync,
    /// Uploaded-file processing.
    Files,
    /// Periodic maintenance sweeps (terminal-job cleanup and the like).
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Reports,
        QueueName::Emails,
        QueueName::Sync,
        QueueName::Files,
        QueueName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Reports => "reports",
            QueueName::Emails => "emails",
            QueueName::Sync => "sync",
            QueueName::Files => "files",
            QueueName::Maintenance => "maintenance",
        }
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reports" => Ok(QueueName::Reports),
            "emails" => Ok(QueueName::Emails),
            "sync" => Ok(QueueName::Sync),
            "files" => Ok(QueueName::Files),
            "maintenance" => Ok(QueueName::Maintenance),
            other => Err(ParseError::queue(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
    }

    #[test]
    fn rejects_unknown_lane() {
        assert!(matches!(
            "priority".parse::<QueueName>(),
            Err(ParseError::Queue(_))
        ));
    }
}
