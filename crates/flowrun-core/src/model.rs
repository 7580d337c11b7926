// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records owned by the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ProgressUpdateType, RunEnvironment, ScheduleOptions};

/// Whether a flow's trigger is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Trigger armed.
    Enabled,
    /// Trigger disarmed.
    Disabled,
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub project_id: String,
    pub status: FlowStatus,
    /// Locked version currently serving production traffic.
    pub published_version_id: Option<String>,
    /// Polling schedule of the published trigger, with its failure counter.
    pub schedule: Option<ScheduleOptions>,
}

/// Editing state of a flow version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVersionState {
    Draft,
    Locked,
}

/// How a webhook trigger keeps its remote subscription alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookRenewal {
    /// Re-run the renewal hook on a cron schedule.
    #[serde(rename_all = "camelCase")]
    Cron { cron_expression: String },
}

/// How a trigger delivers events.
///
/// Adding a strategy is a compile-time change everywhere it is matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStrategy {
    /// The core polls the trigger on a schedule.
    Polling,
    /// The remote app calls a flow-specific webhook URL.
    Webhook {
        #[serde(default)]
        renewal: Option<WebhookRenewal>,
    },
    /// The remote app calls a shared app-level webhook; events are routed
    /// to listening flows by `(app, event, identifier)`.
    AppWebhook,
}

/// Trigger step of a flow version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSource {
    /// Block (plugin) providing the trigger; also the app name for app webhooks.
    pub block_name: String,
    pub trigger_name: String,
    pub strategy: TriggerStrategy,
}

/// One immutable snapshot of a flow's steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowVersion {
    pub id: String,
    pub flow_id: String,
    pub state: FlowVersionState,
    pub trigger: TriggerSource,
}

/// Flow run state machine.
///
/// ```text
/// SCHEDULED ──► RUNNING ──► SUCCEEDED | FAILED | INTERNAL_ERROR | TIMEOUT | STOPPED
///  │  ▲  ▲          │                             │
///  │  │  │ resume   ▼                             │
///  │  │  └──────── PAUSED                         │
///  │  └──────────────── retry ────────────────────┘
///  ▼
/// IGNORED   (enqueue rejected)
/// ```
///
/// Every (re-)enqueue lands in `SCHEDULED`; only the worker moves a run to
/// `RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    InternalError,
    Timeout,
    Stopped,
    Paused,
    Ignored,
}

impl FlowRunStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::InternalError
                | Self::Timeout
                | Self::Stopped
                | Self::Ignored
        )
    }

    /// Status as reported outward; `STOPPED` reads as `SUCCEEDED`.
    pub fn for_reporting(&self) -> Self {
        match self {
            Self::Stopped => Self::Succeeded,
            other => *other,
        }
    }
}

/// Why and how a paused run resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseMetadata {
    /// Resume automatically at `resume_date_time`.
    #[serde(rename_all = "camelCase")]
    Delay {
        resume_date_time: DateTime<Utc>,
        #[serde(default)]
        handler_id: Option<String>,
        #[serde(default)]
        progress_update_type: ProgressUpdateType,
    },
    /// Resume when an external request arrives for `request_id`.
    #[serde(rename_all = "camelCase")]
    Webhook {
        request_id: String,
        #[serde(default)]
        handler_id: Option<String>,
        #[serde(default)]
        progress_update_type: ProgressUpdateType,
    },
}

impl PauseMetadata {
    /// Server instance holding a synchronous caller for this run, if any.
    pub fn handler_id(&self) -> Option<&str> {
        match self {
            Self::Delay { handler_id, .. } | Self::Webhook { handler_id, .. } => {
                handler_id.as_deref()
            }
        }
    }

    /// Progress reporting mode to resume with.
    pub fn progress_update_type(&self) -> ProgressUpdateType {
        match self {
            Self::Delay {
                progress_update_type,
                ..
            }
            | Self::Webhook {
                progress_update_type,
                ..
            } => *progress_update_type,
        }
    }
}

/// One execution attempt of a flow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub id: String,
    pub project_id: String,
    pub flow_id: String,
    pub flow_version_id: String,
    pub status: FlowRunStatus,
    pub environment: RunEnvironment,
    #[serde(default)]
    pub pause_metadata: Option<PauseMetadata>,
    #[serde(default)]
    pub tasks: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub logs_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last time the run was (re-)enqueued. Staleness is measured from here.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}
