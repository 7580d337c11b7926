// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job data model shared by both queue backends.
//!
//! Payloads form a closed union discriminated by `type`:
//!
//! | Type | Queue | Purpose |
//! |------|-------|---------|
//! | `ONE_TIME` | one-time | Begin or resume a flow run immediately |
//! | `REPEATING` | scheduled | Poll a trigger or renew a webhook on a cron |
//! | `DELAYED` | scheduled | Resume a paused run at a future instant |
//! | `WEBHOOK` | webhook | Deliver an inbound webhook/app event to a flow |

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical queue a job lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueName {
    /// Immediate single-fire jobs.
    OneTime,
    /// Repeating and delayed jobs.
    Scheduled,
    /// Inbound webhook deliveries.
    Webhook,
}

impl QueueName {
    /// All queue names.
    pub const ALL: [QueueName; 3] = [QueueName::OneTime, QueueName::Scheduled, QueueName::Webhook];

    /// Key-safe name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one-time",
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Reserved for enterprise organizations on cloud deployments.
    High,
    /// Interactive runs with a synchronous caller waiting.
    Medium,
    /// Everything else.
    #[default]
    Low,
}

impl JobPriority {
    /// Native queue ordering value; smaller dequeues first.
    pub fn engine_value(&self) -> u8 {
        match self {
            Self::High => 2,
            Self::Medium => 3,
            Self::Low => 4,
        }
    }
}

/// Environment a run executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEnvironment {
    /// Live traffic.
    #[default]
    Production,
    /// Test runs from the editor.
    Testing,
}

/// Whether a one-time job starts a run from scratch or continues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Fresh execution from the trigger.
    Begin,
    /// Continue a paused or failed run.
    Resume,
}

/// How the worker reports progress while a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressUpdateType {
    /// No intermediate reporting.
    #[default]
    None,
    /// A synchronous webhook caller is waiting for the response.
    WebhookResponse,
    /// An editor test run is streaming progress.
    TestFlow,
}

/// Kind of repeating job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatableJobType {
    /// Run a polling trigger.
    ExecuteTrigger,
    /// Renew a webhook subscription with the remote app.
    RenewWebhook,
}

/// Kind of delayed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayedJobType {
    /// Resume a paused flow run.
    DelayedFlow,
}

/// Cron schedule attached to a repeating job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOptions {
    /// Cron expression (5 or 6 fields).
    pub cron_expression: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Consecutive trigger failures so far.
    #[serde(default)]
    pub failure_count: u32,
}

/// Payload of a `ONE_TIME` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeJobData {
    pub execution_correlation_id: String,
    pub project_id: String,
    pub environment: RunEnvironment,
    pub run_id: String,
    pub flow_version_id: String,
    pub payload: Value,
    pub execution_type: ExecutionType,
    pub progress_update_type: ProgressUpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous_handler_id: Option<String>,
}

/// Payload of a `REPEATING` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatingJobData {
    pub project_id: String,
    pub flow_version_id: String,
    pub flow_id: String,
    pub job_type: RepeatableJobType,
    pub schedule_options: ScheduleOptions,
}

/// Payload of a `DELAYED` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedJobData {
    pub execution_correlation_id: String,
    pub run_id: String,
    pub project_id: String,
    pub flow_version_id: String,
    pub job_type: DelayedJobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous_handler_id: Option<String>,
    pub progress_update_type: ProgressUpdateType,
}

/// Payload of a `WEBHOOK` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJobData {
    pub flow_id: String,
    pub project_id: String,
    pub payload: Value,
}

/// Job payload, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobData {
    OneTime(OneTimeJobData),
    Repeating(RepeatingJobData),
    Delayed(DelayedJobData),
    Webhook(WebhookJobData),
}

impl JobData {
    /// Project that owns the job.
    pub fn project_id(&self) -> &str {
        match self {
            Self::OneTime(d) => &d.project_id,
            Self::Repeating(d) => &d.project_id,
            Self::Delayed(d) => &d.project_id,
            Self::Webhook(d) => &d.project_id,
        }
    }

    /// Flow version the job executes, when it targets one.
    pub fn flow_version_id(&self) -> Option<&str> {
        match self {
            Self::OneTime(d) => Some(&d.flow_version_id),
            Self::Repeating(d) => Some(&d.flow_version_id),
            Self::Delayed(d) => Some(&d.flow_version_id),
            Self::Webhook(_) => None,
        }
    }

    /// Flow the job belongs to, when the payload names it.
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::Repeating(d) => Some(&d.flow_id),
            Self::Webhook(d) => Some(&d.flow_id),
            Self::OneTime(_) | Self::Delayed(_) => None,
        }
    }
}

/// A request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub enum AddJobRequest {
    /// Fire once, as soon as a worker polls.
    OneTime {
        id: String,
        data: OneTimeJobData,
        priority: JobPriority,
    },
    /// Fire on every occurrence of a cron schedule.
    Repeating {
        id: String,
        data: RepeatingJobData,
        schedule: ScheduleOptions,
    },
    /// Fire once after `delay`.
    Delayed {
        id: String,
        data: DelayedJobData,
        delay: Duration,
    },
    /// Fire once, as soon as a worker polls the webhook queue.
    Webhook {
        id: String,
        data: WebhookJobData,
        priority: JobPriority,
    },
}

impl AddJobRequest {
    /// Job id.
    pub fn id(&self) -> &str {
        match self {
            Self::OneTime { id, .. }
            | Self::Repeating { id, .. }
            | Self::Delayed { id, .. }
            | Self::Webhook { id, .. } => id,
        }
    }

    /// Queue this request targets.
    pub fn queue_name(&self) -> QueueName {
        match self {
            Self::OneTime { .. } => QueueName::OneTime,
            Self::Repeating { .. } | Self::Delayed { .. } => QueueName::Scheduled,
            Self::Webhook { .. } => QueueName::Webhook,
        }
    }

    /// Project that owns the job.
    pub fn project_id(&self) -> &str {
        match self {
            Self::OneTime { data, .. } => &data.project_id,
            Self::Repeating { data, .. } => &data.project_id,
            Self::Delayed { data, .. } => &data.project_id,
            Self::Webhook { data, .. } => &data.project_id,
        }
    }

    /// Priority the job is enqueued with.
    pub fn priority(&self) -> JobPriority {
        match self {
            Self::OneTime { priority, .. } | Self::Webhook { priority, .. } => *priority,
            Self::Repeating { .. } | Self::Delayed { .. } => JobPriority::Low,
        }
    }

    /// Convert into a queued job created at `now`.
    ///
    /// `next_fire_at` is filled in by the backend for repeating jobs; delayed
    /// jobs get `now + delay`.
    pub fn into_queued(self, now: DateTime<Utc>) -> QueuedJob {
        let queue = self.queue_name();
        let priority = self.priority();
        let (id, data, schedule, next_fire_at) = match self {
            Self::OneTime { id, data, .. } => (id, JobData::OneTime(data), None, None),
            Self::Webhook { id, data, .. } => (id, JobData::Webhook(data), None, None),
            Self::Repeating { id, data, schedule } => {
                (id, JobData::Repeating(data), Some(schedule), None)
            }
            Self::Delayed { id, data, delay } => {
                let fire_at = now.timestamp() + delay.as_secs() as i64;
                (id, JobData::Delayed(data), None, Some(fire_at))
            }
        };
        QueuedJob {
            id,
            queue,
            data,
            priority,
            schedule,
            next_fire_at,
            created_at: now,
        }
    }
}

/// A job as held by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub queue: QueueName,
    pub data: JobData,
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleOptions>,
    /// Epoch seconds at which the job becomes eligible; `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Whether the job may be dequeued at `now_epoch_secs`.
    pub fn is_due(&self, now_epoch_secs: i64) -> bool {
        self.next_fire_at.is_none_or(|at| at <= now_epoch_secs)
    }
}

/// Generate a fresh execution-correlation id.
pub fn new_execution_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
