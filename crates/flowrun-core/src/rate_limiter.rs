// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rate-limiter seam consulted by the distributed queue before every enqueue.
//!
//! The throttling algorithm itself lives outside this crate.

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{AddJobRequest, QueueName};

/// Per-project enqueue throttling.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether jobs for this project/queue pair should be held back right now.
    async fn should_throttle(&self, project_id: &str, queue: QueueName) -> Result<bool>;

    /// Take ownership of a throttled job and retry it later.
    async fn defer(&self, job: AddJobRequest) -> Result<()>;
}

/// Rate limiter that never throttles.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn should_throttle(&self, _project_id: &str, _queue: QueueName) -> Result<bool> {
        Ok(false)
    }

    async fn defer(&self, _job: AddJobRequest) -> Result<()> {
        Ok(())
    }
}
