// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow run lifecycle.
//!
//! [`FlowRunService`] owns every status transition of a [`FlowRun`]:
//!
//! | Operation | Transition |
//! |-----------|------------|
//! | [`start`](FlowRunService::start) (BEGIN or RESUME) | → `SCHEDULED`, or `IGNORED` if not enqueued |
//! | [`update_status`](FlowRunService::update_status) | `RUNNING` or a terminal status |
//! | [`pause`](FlowRunService::pause) | → `PAUSED` |
//! | [`resume`](FlowRunService::resume) | `PAUSED` → `SCHEDULED` |
//! | [`retry`](FlowRunService::retry) | terminal → re-enqueued |
//! | [`cleanup_stale_runs`](FlowRunService::cleanup_stale_runs) | stale `SCHEDULED` → `TIMEOUT` |
//!
//! Terminal statuses are final. Every enqueue uses a fresh
//! execution-correlation id so an earlier synchronous listener is never
//! reused.

pub mod side_effects;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Edition;
use crate::error::{Error, Result};
use crate::job::{
    ExecutionType, JobPriority, ProgressUpdateType, RunEnvironment, new_execution_correlation_id,
};
use crate::model::{FlowRun, FlowRunStatus, PauseMetadata};
use crate::store::{ExecutionLogs, FlowRepository, FlowRunRepository};

pub use side_effects::{
    BroadcastEventSink, EnqueueParams, ExecutionEvent, ExecutionEventSink, FlowRunSideEffects,
};

/// Subscription tier of the organization owning a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrganizationTier {
    #[default]
    Standard,
    Enterprise,
}

/// Looks up the plan of the organization owning a project.
#[async_trait]
pub trait ProjectPlanProvider: Send + Sync {
    async fn organization_tier(&self, project_id: &str) -> Result<OrganizationTier>;
}

/// Plan provider that answers the same tier for every project.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPlanProvider(pub OrganizationTier);

#[async_trait]
impl ProjectPlanProvider for StaticPlanProvider {
    async fn organization_tier(&self, _project_id: &str) -> Result<OrganizationTier> {
        Ok(self.0)
    }
}

/// Priority of a run's job.
///
/// Enterprise organizations hosted on the cloud edition get the reserved
/// high priority. Otherwise a waiting synchronous caller gets medium so
/// interactive runs are not starved by batch traffic. Everything else is low.
pub fn job_priority(
    edition: Edition,
    tier: OrganizationTier,
    has_synchronous_handler: bool,
) -> JobPriority {
    match (edition, tier, has_synchronous_handler) {
        (Edition::Cloud, OrganizationTier::Enterprise, _) => JobPriority::High,
        (_, _, true) => JobPriority::Medium,
        (_, _, false) => JobPriority::Low,
    }
}

/// Input of [`FlowRunService::start`].
#[derive(Debug, Clone)]
pub struct StartParams {
    pub project_id: String,
    pub flow_version_id: String,
    pub environment: RunEnvironment,
    pub payload: Value,
    pub execution_type: ExecutionType,
    /// Reuse this run instead of creating one.
    pub existing_run_id: Option<String>,
    pub synchronous_handler_id: Option<String>,
    pub progress_update_type: ProgressUpdateType,
    pub tags: Vec<String>,
}

impl StartParams {
    /// Fresh production run of a flow version.
    pub fn begin(
        project_id: impl Into<String>,
        flow_version_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            flow_version_id: flow_version_id.into(),
            environment: RunEnvironment::Production,
            payload,
            execution_type: ExecutionType::Begin,
            existing_run_id: None,
            synchronous_handler_id: None,
            progress_update_type: ProgressUpdateType::None,
            tags: Vec::new(),
        }
    }

    /// Attach a waiting synchronous caller.
    pub fn with_synchronous_handler(
        mut self,
        handler_id: impl Into<String>,
        progress_update_type: ProgressUpdateType,
    ) -> Self {
        self.synchronous_handler_id = Some(handler_id.into());
        self.progress_update_type = progress_update_type;
        self
    }

    pub fn with_environment(mut self, environment: RunEnvironment) -> Self {
        self.environment = environment;
        self
    }
}

/// Input of [`FlowRunService::update_status`].
#[derive(Debug, Clone)]
pub struct UpdateStatusParams {
    pub run_id: String,
    pub status: FlowRunStatus,
    pub tasks: Option<u32>,
    pub duration_ms: Option<u64>,
    pub logs_file_id: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl UpdateStatusParams {
    pub fn new(run_id: impl Into<String>, status: FlowRunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            status,
            tasks: None,
            duration_ms: None,
            logs_file_id: None,
            tags: None,
        }
    }
}

/// Input of [`FlowRunService::pause`].
#[derive(Debug, Clone)]
pub struct PauseParams {
    pub run_id: String,
    pub pause_metadata: Option<PauseMetadata>,
    pub tasks: Option<u32>,
    pub duration_ms: Option<u64>,
    pub logs_file_id: Option<String>,
}

/// How a failed run is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// Resume the same flow version where it failed.
    FromFailedStep,
    /// Start over on the flow's published version with the original
    /// trigger output as payload.
    OnLatestVersion,
}

/// Flow run state machine.
#[derive(Clone)]
pub struct FlowRunService {
    flows: Arc<dyn FlowRepository>,
    runs: Arc<dyn FlowRunRepository>,
    logs: Arc<dyn ExecutionLogs>,
    plans: Arc<dyn ProjectPlanProvider>,
    side_effects: FlowRunSideEffects,
    edition: Edition,
}

impl FlowRunService {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        runs: Arc<dyn FlowRunRepository>,
        logs: Arc<dyn ExecutionLogs>,
        plans: Arc<dyn ProjectPlanProvider>,
        side_effects: FlowRunSideEffects,
        edition: Edition,
    ) -> Self {
        Self {
            flows,
            runs,
            logs,
            plans,
            side_effects,
            edition,
        }
    }

    /// Load a run.
    pub async fn get(&self, run_id: &str) -> Result<FlowRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| Error::FlowRunNotFound(run_id.to_string()))
    }

    /// Priority for a job of `project_id`.
    pub async fn get_job_priority(
        &self,
        project_id: &str,
        synchronous_handler_id: Option<&str>,
    ) -> Result<JobPriority> {
        let tier = self.plans.organization_tier(project_id).await?;
        Ok(job_priority(
            self.edition,
            tier,
            synchronous_handler_id.is_some(),
        ))
    }

    /// Create or load a run and enqueue it.
    ///
    /// The run is persisted before enqueueing. If the queue does not take
    /// the job (rate limited or duplicate), the run is persisted again as
    /// `IGNORED`.
    pub async fn start(&self, params: StartParams) -> Result<FlowRun> {
        let version = self
            .flows
            .get_version(&params.flow_version_id)
            .await?
            .ok_or_else(|| Error::FlowVersionNotFound(params.flow_version_id.clone()))?;
        let flow = self
            .flows
            .get_flow(&version.flow_id)
            .await?
            .filter(|f| f.project_id == params.project_id)
            .ok_or_else(|| Error::FlowNotFound(version.flow_id.clone()))?;

        let now = Utc::now();
        let mut run = match &params.existing_run_id {
            Some(run_id) => self.get(run_id).await?,
            None => FlowRun {
                id: uuid::Uuid::new_v4().simple().to_string(),
                project_id: flow.project_id.clone(),
                flow_id: flow.id.clone(),
                flow_version_id: version.id.clone(),
                status: FlowRunStatus::Scheduled,
                environment: params.environment,
                pause_metadata: None,
                tasks: 0,
                duration_ms: 0,
                tags: params.tags.clone(),
                logs_file_id: None,
                created_at: now,
                scheduled_at: None,
                started_at: None,
                finished_at: None,
            },
        };

        run.flow_version_id = version.id.clone();
        run.pause_metadata = None;
        run.finished_at = None;
        run.status = FlowRunStatus::Scheduled;
        run.scheduled_at = Some(now);
        self.runs.save(&run).await?;

        let priority = self
            .get_job_priority(&run.project_id, params.synchronous_handler_id.as_deref())
            .await?;
        let execution_correlation_id = new_execution_correlation_id();

        let enqueued = self
            .side_effects
            .start(
                &run,
                EnqueueParams {
                    execution_correlation_id: execution_correlation_id.clone(),
                    payload: params.payload,
                    execution_type: params.execution_type,
                    progress_update_type: params.progress_update_type,
                    synchronous_handler_id: params.synchronous_handler_id,
                    priority,
                },
            )
            .await?;

        if !enqueued {
            run.status = FlowRunStatus::Ignored;
            run.finished_at = Some(Utc::now());
            self.runs.save(&run).await?;
            info!(run_id = %run.id, flow_id = %run.flow_id, "Flow run ignored, job not enqueued");
            return Ok(run);
        }

        debug!(
            run_id = %run.id,
            execution_correlation_id = %execution_correlation_id,
            priority = ?priority,
            execution_type = ?params.execution_type,
            "Flow run enqueued"
        );
        Ok(run)
    }

    /// Record progress or completion reported by a worker.
    ///
    /// `RUNNING` only records the start; any terminal status also fires the
    /// finish side effects. Use [`pause`](Self::pause) to pause.
    pub async fn update_status(&self, params: UpdateStatusParams) -> Result<FlowRun> {
        let mut run = self.get(&params.run_id).await?;
        if run.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Flow run {} is already {:?}",
                run.id, run.status
            )));
        }
        if params.status == FlowRunStatus::Paused {
            return Err(Error::Validation(
                "Pausing requires pause metadata, use pause".to_string(),
            ));
        }

        run.status = params.status;
        if let Some(tasks) = params.tasks {
            run.tasks = tasks;
        }
        if let Some(duration_ms) = params.duration_ms {
            run.duration_ms = duration_ms;
        }
        if params.logs_file_id.is_some() {
            run.logs_file_id = params.logs_file_id;
        }
        if let Some(tags) = params.tags {
            run.tags = tags;
        }

        if run.status == FlowRunStatus::Running {
            run.started_at.get_or_insert_with(Utc::now);
            self.runs.save(&run).await?;
            return Ok(run);
        }

        run.pause_metadata = None;
        run.finished_at = Some(Utc::now());
        self.runs.save(&run).await?;
        self.side_effects.finish(&run);
        Ok(run)
    }

    /// Pause a run. A `DELAY` pause schedules its own resumption.
    pub async fn pause(&self, params: PauseParams) -> Result<FlowRun> {
        let pause_metadata = params
            .pause_metadata
            .ok_or_else(|| Error::Validation("Pause metadata is required".to_string()))?;

        let mut run = self.get(&params.run_id).await?;
        if run.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Flow run {} is already {:?}",
                run.id, run.status
            )));
        }

        run.status = FlowRunStatus::Paused;
        run.pause_metadata = Some(pause_metadata);
        if let Some(tasks) = params.tasks {
            run.tasks = tasks;
        }
        if let Some(duration_ms) = params.duration_ms {
            run.duration_ms = duration_ms;
        }
        if params.logs_file_id.is_some() {
            run.logs_file_id = params.logs_file_id;
        }
        self.runs.save(&run).await?;
        self.side_effects.pause(&run).await?;

        debug!(run_id = %run.id, "Flow run paused");
        Ok(run)
    }

    /// Resume a paused run with `payload`.
    ///
    /// The synchronous caller and progress mode recorded at pause time are
    /// carried over.
    pub async fn resume(&self, run_id: &str, payload: Value) -> Result<FlowRun> {
        let run = self.get(run_id).await?;
        if run.status != FlowRunStatus::Paused {
            return Err(Error::Conflict(format!(
                "Flow run {} is {:?}, not paused",
                run.id, run.status
            )));
        }

        let (synchronous_handler_id, progress_update_type) = match &run.pause_metadata {
            Some(meta) => (
                meta.handler_id().map(str::to_string),
                meta.progress_update_type(),
            ),
            None => (None, ProgressUpdateType::None),
        };

        self.start(StartParams {
            project_id: run.project_id.clone(),
            flow_version_id: run.flow_version_id.clone(),
            environment: run.environment,
            payload,
            execution_type: ExecutionType::Resume,
            existing_run_id: Some(run.id.clone()),
            synchronous_handler_id,
            progress_update_type,
            tags: run.tags.clone(),
        })
        .await
    }

    /// Retry a finished run.
    pub async fn retry(&self, run_id: &str, strategy: RetryStrategy) -> Result<FlowRun> {
        let mut run = self.get(run_id).await?;
        if !run.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Flow run {} is {:?} and cannot be retried",
                run.id, run.status
            )));
        }

        let (flow_version_id, execution_type, payload) = match strategy {
            RetryStrategy::FromFailedStep => {
                (run.flow_version_id.clone(), ExecutionType::Resume, Value::Null)
            }
            RetryStrategy::OnLatestVersion => {
                let flow = self
                    .flows
                    .get_flow(&run.flow_id)
                    .await?
                    .ok_or_else(|| Error::FlowNotFound(run.flow_id.clone()))?;
                let latest = flow
                    .published_version_id
                    .ok_or_else(|| Error::FlowVersionNotFound(flow.id.clone()))?;

                let trigger_output = match &run.logs_file_id {
                    Some(logs_file_id) => self.logs.trigger_output(logs_file_id).await?,
                    None => None,
                };
                if trigger_output.is_none() {
                    warn!(run_id = %run.id, "No trigger output recorded, retrying with empty payload");
                }

                run.flow_version_id = latest.clone();
                run.tasks = 0;
                run.duration_ms = 0;
                self.runs.save(&run).await?;

                (
                    latest,
                    ExecutionType::Begin,
                    trigger_output.unwrap_or(Value::Null),
                )
            }
        };

        info!(run_id = %run.id, strategy = ?strategy, "Retrying flow run");
        self.start(StartParams {
            project_id: run.project_id.clone(),
            flow_version_id,
            environment: run.environment,
            payload,
            execution_type,
            existing_run_id: Some(run.id.clone()),
            synchronous_handler_id: None,
            progress_update_type: ProgressUpdateType::None,
            tags: run.tags.clone(),
        })
        .await
    }

    /// Time out runs enqueued before `older_than` that no worker picked up.
    pub async fn cleanup_stale_runs(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .runs
            .list_stale(FlowRunStatus::Scheduled, older_than)
            .await?;
        let count = stale.len();
        for mut run in stale {
            run.status = FlowRunStatus::Timeout;
            run.finished_at = Some(Utc::now());
            self.runs.save(&run).await?;
            self.side_effects.finish(&run);
        }
        Ok(count)
    }
}
