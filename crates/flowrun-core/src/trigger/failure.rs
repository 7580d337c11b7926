// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consecutive trigger failure counting.
//!
//! Each polling trigger run reports success or failure. A success resets
//! the flow's counter; a failure increments it. When the counter reaches
//! the threshold the flow is disabled and its trigger torn down.
//! All updates happen under the flow's lock.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{FLOW_LOCK_TIMEOUT, TriggerArming};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, with_lock};
use crate::model::FlowStatus;
use crate::store::FlowRepository;

/// Counts trigger failures and auto-disables flows.
pub struct TriggerFailureTracker {
    flows: Arc<dyn FlowRepository>,
    arming: Arc<TriggerArming>,
    lock: Arc<dyn DistributedLock>,
    threshold: u32,
}

impl TriggerFailureTracker {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        arming: Arc<TriggerArming>,
        lock: Arc<dyn DistributedLock>,
        threshold: u32,
    ) -> Self {
        Self {
            flows,
            arming,
            lock,
            threshold,
        }
    }

    /// Reset the flow's failure counter.
    pub async fn record_success(&self, flow_id: &str) -> Result<()> {
        with_lock(self.lock.as_ref(), flow_id, FLOW_LOCK_TIMEOUT, move || async move {
            let Some(mut flow) = self.flows.get_flow(flow_id).await? else {
                return Ok(());
            };
            match flow.schedule.as_mut() {
                Some(schedule) if schedule.failure_count > 0 => {
                    schedule.failure_count = 0;
                    self.flows.save_flow(&flow).await?;
                    debug!(flow_id = %flow_id, "Trigger failure count reset");
                }
                _ => {}
            }
            Ok(())
        })
        .await
    }

    /// Count one failure. Returns `true` if the flow was disabled.
    pub async fn record_failure(&self, flow_id: &str) -> Result<bool> {
        with_lock(self.lock.as_ref(), flow_id, FLOW_LOCK_TIMEOUT, move || async move {
            let mut flow = self
                .flows
                .get_flow(flow_id)
                .await?
                .ok_or_else(|| Error::FlowNotFound(flow_id.to_string()))?;

            let Some(schedule) = flow.schedule.as_mut() else {
                return Ok(false);
            };
            schedule.failure_count += 1;
            let failures = schedule.failure_count;

            if failures < self.threshold {
                self.flows.save_flow(&flow).await?;
                debug!(flow_id = %flow_id, failures = failures, "Trigger failure recorded");
                return Ok(false);
            }

            if let Some(version_id) = &flow.published_version_id {
                let version = self
                    .flows
                    .get_version(version_id)
                    .await?
                    .ok_or_else(|| Error::FlowVersionNotFound(version_id.clone()))?;
                self.arming
                    .disarm(&flow.project_id, &version, false, true)
                    .await?;
            }

            flow.status = FlowStatus::Disabled;
            flow.schedule = None;
            self.flows.save_flow(&flow).await?;

            warn!(
                flow_id = %flow_id,
                failures = failures,
                threshold = self.threshold,
                "Flow disabled after repeated trigger failures"
            );
            Ok(true)
        })
        .await
    }
}
