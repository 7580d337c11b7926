// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations exposed to execution workers.
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`poll`](WorkerApi::poll) | dequeue a job and issue an engine token for it |
//! | [`update_job`](WorkerApi::update_job) | report a job outcome (feeds trigger failure tracking) |
//! | [`update_run`](WorkerApi::update_run) | push run status, deliver a synchronous response |
//! | [`resume_run`](WorkerApi::resume_run) | resume a paused run |
//! | [`remove_stale_job`](WorkerApi::remove_stale_job) | disarm a trigger whose flow is gone |
//!
//! Every operation but `poll` requires the engine token issued with the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::flow_run::{FlowRunService, PauseParams, UpdateStatusParams};
use crate::job::{JobData, QueueName, QueuedJob, RepeatableJobType};
use crate::model::{FlowRun, FlowRunStatus, FlowStatus, PauseMetadata};
use crate::queue::QueueManager;
use crate::store::FlowRepository;
use crate::trigger::{TriggerArming, TriggerFailureTracker};
use crate::webhook_response::{EngineHttpResponse, WebhookResponseWatcher};

/// Claims of an engine token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTokenClaims {
    /// Job id.
    pub sub: String,
    pub project_id: String,
    pub queue: QueueName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<RepeatableJobType>,
    pub exp: i64,
}

/// Issues and verifies HS256 engine tokens.
pub struct EngineTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl EngineTokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Token for a dequeued job.
    pub fn issue(&self, job: &QueuedJob) -> Result<String> {
        let job_type = match &job.data {
            JobData::Repeating(data) => Some(data.job_type),
            _ => None,
        };
        let claims = EngineTokenClaims {
            sub: job.id.clone(),
            project_id: job.data.project_id().to_string(),
            queue: job.queue,
            flow_id: job.data.flow_id().map(str::to_string),
            job_type,
            exp: Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<EngineTokenClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<EngineTokenClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

/// A dequeued job as handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolledJob {
    pub id: String,
    pub data: JobData,
    pub engine_token: String,
}

/// Outcome of a job reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Body of `update-job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub outcome: JobOutcome,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of `update-run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRunRequest {
    pub run_id: String,
    pub status: FlowRunStatus,
    #[serde(default)]
    pub tasks: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub logs_file_id: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub pause_metadata: Option<PauseMetadata>,
    /// Correlation id of the execution, for synchronous responses.
    #[serde(default)]
    pub execution_correlation_id: Option<String>,
    /// Server instance holding the synchronous caller.
    #[serde(default)]
    pub synchronous_handler_id: Option<String>,
    #[serde(default)]
    pub http_response: Option<EngineHttpResponse>,
}

/// Worker-facing boundary.
pub struct WorkerApi {
    queue: Arc<dyn QueueManager>,
    tokens: EngineTokenIssuer,
    flows: Arc<dyn FlowRepository>,
    flow_runs: FlowRunService,
    arming: Arc<TriggerArming>,
    failures: Arc<TriggerFailureTracker>,
    watcher: Arc<WebhookResponseWatcher>,
}

impl WorkerApi {
    pub fn new(
        queue: Arc<dyn QueueManager>,
        tokens: EngineTokenIssuer,
        flows: Arc<dyn FlowRepository>,
        flow_runs: FlowRunService,
        arming: Arc<TriggerArming>,
        failures: Arc<TriggerFailureTracker>,
        watcher: Arc<WebhookResponseWatcher>,
    ) -> Self {
        Self {
            queue,
            tokens,
            flows,
            flow_runs,
            arming,
            failures,
            watcher,
        }
    }

    /// Dequeue the next job of `queue`.
    pub async fn poll(&self, queue: QueueName) -> Result<Option<PolledJob>> {
        let Some(job) = self.queue.poll(queue).await? else {
            return Ok(None);
        };
        let engine_token = self.tokens.issue(&job)?;
        debug!(job_id = %job.id, queue = %queue, "Job handed to worker");
        Ok(Some(PolledJob {
            id: job.id,
            data: job.data,
            engine_token,
        }))
    }

    /// Record a job outcome. Trigger runs feed the failure tracker.
    pub async fn update_job(&self, engine_token: &str, request: UpdateJobRequest) -> Result<()> {
        let claims = self.tokens.verify(engine_token)?;

        let (Some(RepeatableJobType::ExecuteTrigger), Some(flow_id)) =
            (claims.job_type, claims.flow_id.as_deref())
        else {
            debug!(job_id = %claims.sub, outcome = ?request.outcome, "Job outcome recorded");
            return Ok(());
        };

        match request.outcome {
            JobOutcome::Succeeded => self.failures.record_success(flow_id).await,
            JobOutcome::Failed => {
                debug!(
                    flow_id = %flow_id,
                    message = request.message.as_deref().unwrap_or(""),
                    "Trigger run failed"
                );
                self.failures.record_failure(flow_id).await.map(|_| ())
            }
        }
    }

    /// Apply a run status pushed by a worker.
    ///
    /// A synchronous response, if present, is published to the holding
    /// server before the run is updated.
    pub async fn update_run(&self, engine_token: &str, request: UpdateRunRequest) -> Result<FlowRun> {
        let claims = self.tokens.verify(engine_token)?;
        let run = self.flow_runs.get(&request.run_id).await?;
        if run.project_id != claims.project_id {
            return Err(Error::Unauthorized(format!(
                "Token does not grant access to run {}",
                run.id
            )));
        }

        if let (Some(correlation_id), Some(handler_id), Some(response)) = (
            request.execution_correlation_id.as_deref(),
            request.synchronous_handler_id.as_deref(),
            request.http_response,
        ) {
            self.watcher
                .publish(correlation_id, handler_id, response)
                .await?;
        }

        if request.status == FlowRunStatus::Paused {
            self.flow_runs
                .pause(PauseParams {
                    run_id: request.run_id,
                    pause_metadata: request.pause_metadata,
                    tasks: request.tasks,
                    duration_ms: request.duration_ms,
                    logs_file_id: request.logs_file_id,
                })
                .await
        } else {
            self.flow_runs
                .update_status(UpdateStatusParams {
                    run_id: request.run_id,
                    status: request.status,
                    tasks: request.tasks,
                    duration_ms: request.duration_ms,
                    logs_file_id: request.logs_file_id,
                    tags: request.tags,
                })
                .await
        }
    }

    /// Resume a paused run, e.g. when its DELAYED job fires.
    pub async fn resume_run(
        &self,
        engine_token: &str,
        run_id: &str,
        payload: Value,
    ) -> Result<FlowRun> {
        let claims = self.tokens.verify(engine_token)?;
        let run = self.flow_runs.get(run_id).await?;
        if run.project_id != claims.project_id {
            return Err(Error::Unauthorized(format!(
                "Token does not grant access to run {}",
                run.id
            )));
        }
        self.flow_runs.resume(run_id, payload).await
    }

    /// Disarm the trigger of a job whose flow no longer exists.
    ///
    /// An enabled flow is left alone.
    pub async fn remove_stale_job(
        &self,
        engine_token: &str,
        flow_id: &str,
        flow_version_id: &str,
    ) -> Result<()> {
        let claims = self.tokens.verify(engine_token)?;

        if let Some(flow) = self.flows.get_flow(flow_id).await?
            && flow.status == FlowStatus::Enabled
        {
            debug!(flow_id = %flow_id, "Flow still enabled, keeping job");
            return Ok(());
        }

        match self.flows.get_version(flow_version_id).await? {
            Some(version) => {
                self.arming
                    .disable(&claims.project_id, &version, false, true)
                    .await?;
            }
            None => self.queue.remove_repeating_job(flow_version_id).await?,
        }

        info!(
            flow_id = %flow_id,
            flow_version_id = %flow_version_id,
            "Removed stale trigger job"
        );
        Ok(())
    }
}
