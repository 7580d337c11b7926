// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App-level webhook routing.
//!
//! Some apps deliver all their events to one shared webhook. Flows whose
//! trigger uses that delivery register listeners keyed by
//! `(app, event, identifier)`; an inbound event is fanned out as one
//! `WEBHOOK` job per matching listener.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::job::{AddJobRequest, JobPriority, WebhookJobData, new_execution_correlation_id};
use crate::queue::QueueManager;

/// A flow listening for one app event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEventListener {
    pub project_id: String,
    pub flow_id: String,
    pub app_name: String,
    pub event: String,
    /// Value identifying the remote account or resource, e.g. a team id.
    pub identifier_value: String,
}

/// An event received on an app-level webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEvent {
    pub app_name: String,
    pub event: String,
    pub identifier_value: String,
    pub payload: Value,
}

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingSummary {
    /// Listeners matching the event.
    pub matched: usize,
    /// Jobs the queue accepted.
    pub enqueued: usize,
}

/// Listener persistence.
#[async_trait]
pub trait AppEventListenerStore: Send + Sync {
    /// Insert a listener; inserting an identical one again is a no-op.
    async fn upsert(&self, listener: AppEventListener) -> Result<()>;

    /// Delete every listener of a flow. Returns how many were deleted.
    async fn delete_by_flow(&self, project_id: &str, flow_id: &str) -> Result<usize>;

    /// Listeners for `(app_name, event, identifier_value)`.
    async fn find(
        &self,
        app_name: &str,
        event: &str,
        identifier_value: &str,
    ) -> Result<Vec<AppEventListener>>;
}

/// In-memory listener store.
#[derive(Default)]
pub struct MemoryAppEventListenerStore {
    listeners: RwLock<HashSet<AppEventListener>>,
}

impl MemoryAppEventListenerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored listeners.
    pub async fn count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

#[async_trait]
impl AppEventListenerStore for MemoryAppEventListenerStore {
    async fn upsert(&self, listener: AppEventListener) -> Result<()> {
        self.listeners.write().await.insert(listener);
        Ok(())
    }

    async fn delete_by_flow(&self, project_id: &str, flow_id: &str) -> Result<usize> {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| !(l.project_id == project_id && l.flow_id == flow_id));
        Ok(before - listeners.len())
    }

    async fn find(
        &self,
        app_name: &str,
        event: &str,
        identifier_value: &str,
    ) -> Result<Vec<AppEventListener>> {
        Ok(self
            .listeners
            .read()
            .await
            .iter()
            .filter(|l| {
                l.app_name == app_name && l.event == event && l.identifier_value == identifier_value
            })
            .cloned()
            .collect())
    }
}

/// Registers listeners and fans app events out to listening flows.
pub struct AppEventRoutingService {
    store: Arc<dyn AppEventListenerStore>,
    queue: Arc<dyn QueueManager>,
}

impl AppEventRoutingService {
    pub fn new(store: Arc<dyn AppEventListenerStore>, queue: Arc<dyn QueueManager>) -> Self {
        Self { store, queue }
    }

    pub async fn add_listener(&self, listener: AppEventListener) -> Result<()> {
        debug!(
            flow_id = %listener.flow_id,
            app_name = %listener.app_name,
            event = %listener.event,
            "Registering app event listener"
        );
        self.store.upsert(listener).await
    }

    /// Remove every listener of a flow.
    pub async fn delete_listeners(&self, project_id: &str, flow_id: &str) -> Result<usize> {
        let deleted = self.store.delete_by_flow(project_id, flow_id).await?;
        debug!(flow_id = %flow_id, deleted = deleted, "Deleted app event listeners");
        Ok(deleted)
    }

    /// Enqueue one `WEBHOOK` job per listener of `event`.
    pub async fn route(&self, event: AppEvent) -> Result<RoutingSummary> {
        let listeners = self
            .store
            .find(&event.app_name, &event.event, &event.identifier_value)
            .await?;

        let mut summary = RoutingSummary {
            matched: listeners.len(),
            enqueued: 0,
        };

        for listener in listeners {
            let job = AddJobRequest::Webhook {
                id: new_execution_correlation_id(),
                data: WebhookJobData {
                    flow_id: listener.flow_id,
                    project_id: listener.project_id,
                    payload: event.payload.clone(),
                },
                priority: JobPriority::Low,
            };
            if self.queue.add(job).await? {
                summary.enqueued += 1;
            }
        }

        info!(
            app_name = %event.app_name,
            event = %event.event,
            matched = summary.matched,
            enqueued = summary.enqueued,
            "Routed app event"
        );
        Ok(summary)
    }
}
