//! `reportsmith-store` — durable storage for jobs.
//!
//! The queue engine treats storage as a black box offering atomic
//! primitives: push a waiting job, claim the next ready one, renew or lose
//! a lock, move a job to a terminal state, and sweep for stalled locks.
//! Two implementations live here: an in-memory store for tests/dev and a
//! Redis-backed store (behind the `redis` feature) for deployments.

pub mod contract;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use contract::{JobStore, QueueStats, ReclaimOutcome, StoreError};
pub use memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use redis::RedisJobStore;
