//! Worker process: one pool and one stall monitor per served queue.

mod config;
mod processors;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{error, info, warn};

use reportsmith_core::QueueName;
use reportsmith_engine::{
    Processor, StallMonitor, StallMonitorConfig, WorkerPool, WorkerPoolConfig,
};
use reportsmith_store::{InMemoryJobStore, JobStore};

use crate::config::WorkerConfig;
use crate::processors::{
    EmailProcessor, FileProcessor, MaintenanceProcessor, ReportProcessor, SyncProcessor,
};

#[tokio::main]
async fn main() -> Result<()> {
    reportsmith_observability::init();

    let config = WorkerConfig::from_env()?;
    let store = build_store(&config)?;
    info!(
        queues = ?config.queues.iter().map(|q| q.as_str()).collect::<Vec<_>>(),
        concurrency = config.concurrency,
        lock_secs = config.lock_duration.as_secs(),
        "worker starting"
    );

    let mut pools = Vec::new();
    let mut monitors = Vec::new();
    for &queue in &config.queues {
        let pool_config = WorkerPoolConfig::default()
            .with_concurrency(config.concurrency)
            .with_lock_duration(config.lock_duration)
            .with_name("reportsmith");
        let pool = WorkerPool::new(store.clone(), queue, processor_for(queue, &store, &config));
        pools.push((queue, pool.spawn(pool_config)));

        // Sweep well inside one lock lifetime so stalled jobs are not
        // stuck for longer than necessary.
        let monitor_config =
            StallMonitorConfig::default().with_sweep_interval(config.lock_duration / 2);
        monitors.push(StallMonitor::spawn(store.clone(), queue, monitor_config));
    }

    wait_for_shutdown().await;
    info!("shutdown signal received; draining");

    // All pools drain against one shared deadline.
    let deadline = Instant::now() + config.drain_timeout;
    let mut clean = true;
    for (queue, handle) in pools {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if handle.drain(remaining).is_err() {
            error!(queue = %queue, "drain timed out; in-flight jobs left to stall recovery");
            clean = false;
        }
    }
    for monitor in monitors {
        monitor.shutdown();
    }

    if clean {
        info!("drained cleanly");
        Ok(())
    } else {
        anyhow::bail!("drain timed out")
    }
}

fn build_store(config: &WorkerConfig) -> Result<Arc<dyn JobStore>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store =
                reportsmith_store::RedisJobStore::new(url)?.with_retention(config.retention);
            info!("using redis job store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!(
            "REPORTSMITH_REDIS_URL is set but this binary was built without the `redis` feature"
        ),
        None => {
            warn!("REPORTSMITH_REDIS_URL not set; using in-process store (jobs do not survive restart)");
            Ok(InMemoryJobStore::arc() as Arc<dyn JobStore>)
        }
    }
}

fn processor_for(
    queue: QueueName,
    store: &Arc<dyn JobStore>,
    config: &WorkerConfig,
) -> Arc<dyn Processor> {
    match queue {
        QueueName::Reports => Arc::new(ReportProcessor),
        QueueName::Emails => Arc::new(EmailProcessor),
        QueueName::Sync => Arc::new(SyncProcessor),
        QueueName::Files => Arc::new(FileProcessor),
        QueueName::Maintenance => {
            Arc::new(MaintenanceProcessor::new(store.clone(), config.retention))
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
