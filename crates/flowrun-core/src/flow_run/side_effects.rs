// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Effects of flow run transitions outside the run record itself: queue
//! jobs and execution events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Result;
use crate::job::{
    AddJobRequest, DelayedJobData, DelayedJobType, ExecutionType, JobPriority, OneTimeJobData,
    ProgressUpdateType, new_execution_correlation_id,
};
use crate::model::{FlowRun, FlowRunStatus, PauseMetadata};
use crate::queue::QueueManager;

/// Lifecycle notification for observers (editor streams, analytics).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        run_id: String,
        flow_id: String,
        project_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RunPaused {
        run_id: String,
        flow_id: String,
        project_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished {
        run_id: String,
        flow_id: String,
        project_id: String,
        status: FlowRunStatus,
    },
}

/// Receiver of execution events.
pub trait ExecutionEventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Fans events out over a broadcast channel.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ExecutionEventSink for BroadcastEventSink {
    fn emit(&self, event: ExecutionEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

/// Everything needed to enqueue a run's one-time job.
#[derive(Debug, Clone)]
pub struct EnqueueParams {
    pub execution_correlation_id: String,
    pub payload: Value,
    pub execution_type: ExecutionType,
    pub progress_update_type: ProgressUpdateType,
    pub synchronous_handler_id: Option<String>,
    pub priority: JobPriority,
}

/// DELAYED job that resumes a paused run at its resume time.
///
/// Returns `None` unless the run carries `DELAY` pause metadata. A resume
/// time in the past yields a zero delay. The job id is the run id, so
/// re-creating it for the same pause is idempotent.
pub fn delayed_resume_job(run: &FlowRun, now: DateTime<Utc>) -> Option<AddJobRequest> {
    let Some(PauseMetadata::Delay {
        resume_date_time,
        handler_id,
        progress_update_type,
    }) = &run.pause_metadata
    else {
        return None;
    };

    let delay = (*resume_date_time - now).to_std().unwrap_or(Duration::ZERO);

    Some(AddJobRequest::Delayed {
        id: run.id.clone(),
        data: DelayedJobData {
            execution_correlation_id: new_execution_correlation_id(),
            run_id: run.id.clone(),
            project_id: run.project_id.clone(),
            flow_version_id: run.flow_version_id.clone(),
            job_type: DelayedJobType::DelayedFlow,
            synchronous_handler_id: handler_id.clone(),
            progress_update_type: *progress_update_type,
        },
        delay,
    })
}

/// Queue and event effects of run transitions.
#[derive(Clone)]
pub struct FlowRunSideEffects {
    queue: Arc<dyn QueueManager>,
    events: Arc<dyn ExecutionEventSink>,
}

impl FlowRunSideEffects {
    pub fn new(queue: Arc<dyn QueueManager>, events: Arc<dyn ExecutionEventSink>) -> Self {
        Self { queue, events }
    }

    /// Enqueue the run's one-time job. Returns whether it was enqueued.
    pub async fn start(&self, run: &FlowRun, params: EnqueueParams) -> Result<bool> {
        let job = AddJobRequest::OneTime {
            id: params.execution_correlation_id.clone(),
            data: OneTimeJobData {
                execution_correlation_id: params.execution_correlation_id,
                project_id: run.project_id.clone(),
                environment: run.environment,
                run_id: run.id.clone(),
                flow_version_id: run.flow_version_id.clone(),
                payload: params.payload,
                execution_type: params.execution_type,
                progress_update_type: params.progress_update_type,
                synchronous_handler_id: params.synchronous_handler_id,
            },
            priority: params.priority,
        };

        let enqueued = self.queue.add(job).await?;
        if enqueued {
            self.events.emit(ExecutionEvent::RunStarted {
                run_id: run.id.clone(),
                flow_id: run.flow_id.clone(),
                project_id: run.project_id.clone(),
            });
        }
        Ok(enqueued)
    }

    /// Schedule the resume job of a paused run, if it pauses on a delay.
    pub async fn pause(&self, run: &FlowRun) -> Result<()> {
        if let Some(job) = delayed_resume_job(run, Utc::now()) {
            let enqueued = self.queue.add(job).await?;
            debug!(run_id = %run.id, enqueued = enqueued, "Delayed resume scheduled");
        }
        self.events.emit(ExecutionEvent::RunPaused {
            run_id: run.id.clone(),
            flow_id: run.flow_id.clone(),
            project_id: run.project_id.clone(),
        });
        Ok(())
    }

    /// Announce a terminal run.
    pub fn finish(&self, run: &FlowRun) {
        let status = run.status.for_reporting();
        info!(run_id = %run.id, status = ?status, "Flow run finished");
        self.events.emit(ExecutionEvent::RunFinished {
            run_id: run.id.clone(),
            flow_id: run.flow_id.clone(),
            project_id: run.project_id.clone(),
            status,
        });
    }
}
