// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue contract and its two backends.
//!
//! | Backend | Deployment | Ordering |
//! |---------|------------|----------|
//! | [`memory::MemoryQueueManager`] | single server instance | first eligible job found |
//! | [`redis::RedisQueueManager`] | any number of instances | priority, then insertion time |
//!
//! The backend is chosen once by the runtime builder from
//! [`QueueMode`](crate::config::QueueMode); nothing else branches on it.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{AddJobRequest, QueueName, QueuedJob};

pub use memory::MemoryQueueManager;
pub use redis::{RedisQueueManager, RedisQueueOptions};

/// Contract shared by every queue backend.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Backend identifier (e.g., "memory", "redis").
    fn backend(&self) -> &'static str;

    /// Idempotent startup work (re-hydration, migrations, stale cleanup).
    async fn init(&self) -> Result<()>;

    /// Enqueue a job.
    ///
    /// Returns `false` when the job was rate-limited or an entry with the
    /// same id already exists.
    async fn add(&self, job: AddJobRequest) -> Result<bool>;

    /// Dequeue the next eligible job from `queue`, if any.
    ///
    /// Repeating jobs are re-scheduled at their next occurrence before the
    /// dequeued instance is returned.
    async fn poll(&self, queue: QueueName) -> Result<Option<QueuedJob>>;

    /// Remove the repeating job that belongs to a flow version.
    async fn remove_repeating_job(&self, flow_version_id: &str) -> Result<()>;

    /// Ids of one-time jobs enqueued before `older_than`.
    async fn find_jobs_older_than(&self, older_than: DateTime<Utc>) -> Result<Vec<String>>;

    /// Remove a job by id. Removing an absent job is not an error.
    async fn remove_job(&self, queue: QueueName, job_id: &str) -> Result<()>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> bool;
}
