//! `reportsmith-engine` — the queue engine.
//!
//! ## Components
//!
//! - `Queue`: typed front door for one lane of work (enqueue + status)
//! - `Processor`/`JobContext`: the contract the application implements
//! - `WorkerPool`: bounded-concurrency execution loop with heartbeating
//! - `StallMonitor`: reclaims jobs whose workers stopped heartbeating
//!
//! All components take their store and clock explicitly; there is no
//! process-wide registry.

pub mod pool;
pub mod processor;
pub mod queue;
pub mod stall;

pub use pool::{DrainTimeout, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
pub use processor::{JobContext, Processor, ProcessorError};
pub use queue::{EnqueueError, EnqueueOptions, Queue, QueueConfig};
pub use stall::{StallMonitor, StallMonitorConfig, StallMonitorHandle, SweepReport};
