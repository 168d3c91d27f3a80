//! Environment-driven worker configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use reportsmith_core::QueueName;

/// Runtime settings for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Durable backend. `None` runs the in-process store, which only makes
    /// sense for local development.
    pub redis_url: Option<String>,
    /// Execution slots per queue.
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub drain_timeout: Duration,
    /// Queues this process serves.
    pub queues: Vec<QueueName>,
    /// How long terminal jobs are kept before purging.
    pub retention: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            concurrency: 5,
            lock_duration: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            queues: QueueName::ALL.to_vec(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl WorkerConfig {
    /// Read settings from `REPORTSMITH_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.redis_url = std::env::var("REPORTSMITH_REDIS_URL").ok();

        if let Ok(raw) = std::env::var("REPORTSMITH_CONCURRENCY") {
            config.concurrency = raw
                .parse::<usize>()
                .context("REPORTSMITH_CONCURRENCY must be a positive integer")?
                .max(1);
        }
        if let Ok(raw) = std::env::var("REPORTSMITH_LOCK_SECS") {
            let secs: u64 = raw
                .parse()
                .context("REPORTSMITH_LOCK_SECS must be a positive integer")?;
            config.lock_duration = Duration::from_secs(secs.max(1));
        }
        if let Ok(raw) = std::env::var("REPORTSMITH_DRAIN_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .context("REPORTSMITH_DRAIN_TIMEOUT_SECS must be a positive integer")?;
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("REPORTSMITH_RETENTION_DAYS") {
            let days: u64 = raw
                .parse()
                .context("REPORTSMITH_RETENTION_DAYS must be a positive integer")?;
            config.retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Ok(raw) = std::env::var("REPORTSMITH_QUEUES") {
            config.queues = parse_queues(&raw)?;
        }

        Ok(config)
    }
}

fn parse_queues(raw: &str) -> Result<Vec<QueueName>> {
    let mut queues = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let queue: QueueName = part
            .parse()
            .with_context(|| format!("unknown queue in REPORTSMITH_QUEUES: {part:?}"))?;
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }
    anyhow::ensure!(!queues.is_empty(), "REPORTSMITH_QUEUES selected no queues");
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queue_list_with_duplicates_and_whitespace() {
        let queues = parse_queues("emails, reports,emails").unwrap();
        assert_eq!(queues, vec![QueueName::Emails, QueueName::Reports]);
    }

    #[test]
    fn rejects_unknown_queue() {
        assert!(parse_queues("emails,shipping").is_err());
    }

    #[test]
    fn rejects_empty_queue_list() {
        assert!(parse_queues(" , ").is_err());
    }

    #[test]
    fn defaults_cover_all_queues() {
        let config = WorkerConfig::default();
        assert_eq!(config.queues.len(), 5);
        assert_eq!(config.concurrency, 5);
    }
}
