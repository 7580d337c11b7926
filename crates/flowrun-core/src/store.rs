// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces.
//!
//! Flows, versions and runs are owned by an external persistence layer. The
//! core only needs the narrow operations below. In-memory implementations are
//! provided for single-process deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{Flow, FlowRun, FlowRunStatus, FlowStatus, FlowVersion, PauseMetadata};

/// Flow and flow version storage.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Load a flow by id.
    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>>;

    /// Insert or replace a flow.
    async fn save_flow(&self, flow: &Flow) -> Result<()>;

    /// Load a flow version by id.
    async fn get_version(&self, flow_version_id: &str) -> Result<Option<FlowVersion>>;

    /// Enabled flows that carry a polling schedule.
    async fn list_enabled_with_schedule(&self) -> Result<Vec<Flow>>;
}

/// Flow run storage.
#[async_trait]
pub trait FlowRunRepository: Send + Sync {
    /// Load a run by id.
    async fn get(&self, run_id: &str) -> Result<Option<FlowRun>>;

    /// Insert or replace a run.
    async fn save(&self, run: &FlowRun) -> Result<()>;

    /// Paused runs whose pause metadata names a resume time.
    async fn list_paused_with_resume_time(&self) -> Result<Vec<FlowRun>>;

    /// Runs in `status` last scheduled before `older_than`.
    ///
    /// Runs that were never scheduled fall back to `created_at`.
    async fn list_stale(
        &self,
        status: FlowRunStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<FlowRun>>;
}

/// Read access to serialized execution logs.
#[async_trait]
pub trait ExecutionLogs: Send + Sync {
    /// Output of the trigger step recorded in a run's execution log.
    async fn trigger_output(&self, logs_file_id: &str) -> Result<Option<Value>>;
}

/// In-memory flow repository.
#[derive(Default)]
pub struct MemoryFlowRepository {
    flows: RwLock<HashMap<String, Flow>>,
    versions: RwLock<HashMap<String, FlowVersion>>,
}

impl MemoryFlowRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a flow version.
    pub async fn insert_version(&self, version: FlowVersion) {
        self.versions
            .write()
            .await
            .insert(version.id.clone(), version);
    }

    /// Remove a flow.
    pub async fn delete_flow(&self, flow_id: &str) {
        self.flows.write().await.remove(flow_id);
    }
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>> {
        Ok(self.flows.read().await.get(flow_id).cloned())
    }

    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        self.flows
            .write()
            .await
            .insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    async fn get_version(&self, flow_version_id: &str) -> Result<Option<FlowVersion>> {
        Ok(self.versions.read().await.get(flow_version_id).cloned())
    }

    async fn list_enabled_with_schedule(&self) -> Result<Vec<Flow>> {
        Ok(self
            .flows
            .read()
            .await
            .values()
            .filter(|f| {
                f.status == FlowStatus::Enabled
                    && f.schedule.is_some()
                    && f.published_version_id.is_some()
            })
            .cloned()
            .collect())
    }
}

/// In-memory flow run repository.
#[derive(Default)]
pub struct MemoryFlowRunRepository {
    runs: RwLock<HashMap<String, FlowRun>>,
}

impl MemoryFlowRunRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowRunRepository for MemoryFlowRunRepository {
    async fn get(&self, run_id: &str) -> Result<Option<FlowRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn save(&self, run: &FlowRun) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_paused_with_resume_time(&self) -> Result<Vec<FlowRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| {
                r.status == FlowRunStatus::Paused
                    && matches!(r.pause_metadata, Some(PauseMetadata::Delay { .. }))
            })
            .cloned()
            .collect())
    }

    async fn list_stale(
        &self,
        status: FlowRunStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<FlowRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| {
                r.status == status && r.scheduled_at.unwrap_or(r.created_at) < older_than
            })
            .cloned()
            .collect())
    }
}

/// In-memory execution log index.
#[derive(Default)]
pub struct MemoryExecutionLogs {
    trigger_outputs: RwLock<HashMap<String, Value>>,
}

impl MemoryExecutionLogs {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the trigger output stored under `logs_file_id`.
    pub async fn record(&self, logs_file_id: &str, trigger_output: Value) {
        self.trigger_outputs
            .write()
            .await
            .insert(logs_file_id.to_string(), trigger_output);
    }
}

#[async_trait]
impl ExecutionLogs for MemoryExecutionLogs {
    async fn trigger_output(&self, logs_file_id: &str) -> Result<Option<Value>> {
        Ok(self.trigger_outputs.read().await.get(logs_file_id).cloned())
    }
}
