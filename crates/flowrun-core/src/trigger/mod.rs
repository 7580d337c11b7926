// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger arming and disarming.
//!
//! Enabling a flow version runs its trigger's `ON_ENABLE` hook in the
//! execution engine, then arms the trigger according to its strategy:
//!
//! | Strategy | Armed as |
//! |----------|----------|
//! | `POLLING` | `EXECUTE_TRIGGER` repeating job |
//! | `WEBHOOK` with cron renewal | `RENEW_WEBHOOK` repeating job |
//! | `WEBHOOK` without renewal | nothing |
//! | `APP_WEBHOOK` | one listener per `(event, identifier)` from the hook |
//!
//! Disabling runs `ON_DISABLE` and always tears down what enabling armed,
//! even if the hook fails.
//!
//! A polling schedule is recorded on the owning [`Flow`](crate::model::Flow)
//! when armed and cleared on disable, under the flow's lock. That record
//! drives failure counting and in-memory re-hydration at startup.

pub mod failure;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app_event::{AppEventListener, AppEventRoutingService};
use crate::error::{Error, Result};
use crate::exception::ExceptionReporter;
use crate::job::{AddJobRequest, RepeatableJobType, RepeatingJobData, ScheduleOptions};
use crate::lock::{DistributedLock, with_lock};
use crate::model::{FlowVersion, TriggerStrategy, WebhookRenewal};
use crate::queue::QueueManager;
use crate::schedule::{self, DEFAULT_TIMEZONE, polling_cron};
use crate::store::FlowRepository;

pub use failure::TriggerFailureTracker;

/// How long to wait for the flow lock.
pub(crate) const FLOW_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Trigger lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerHookType {
    OnEnable,
    OnDisable,
}

/// Listener requested by an `ON_ENABLE` hook of an app webhook trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRequest {
    pub event: String,
    pub identifier_value: String,
}

/// Schedule proposed by a polling trigger's hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedSchedule {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// Result of running a trigger hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerHookResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub listeners: Vec<ListenerRequest>,
    #[serde(default)]
    pub schedule: Option<ProposedSchedule>,
}

/// Runs trigger hooks in the execution engine.
#[async_trait]
pub trait TriggerHookExecutor: Send + Sync {
    async fn execute(
        &self,
        hook: TriggerHookType,
        project_id: &str,
        flow_version: &FlowVersion,
        simulate: bool,
    ) -> Result<TriggerHookResponse>;
}

/// Hook executor used when no execution engine is attached.
///
/// Every hook fails, so enabling arms nothing and disabling only tears down.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHookExecutor;

#[async_trait]
impl TriggerHookExecutor for DetachedHookExecutor {
    async fn execute(
        &self,
        hook: TriggerHookType,
        _project_id: &str,
        flow_version: &FlowVersion,
        _simulate: bool,
    ) -> Result<TriggerHookResponse> {
        Err(Error::Hook(format!(
            "no execution engine attached to run {:?} for {}",
            hook, flow_version.id
        )))
    }
}

/// What enabling a trigger armed.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerArmingRecord {
    pub flow_version_id: String,
    pub strategy: TriggerStrategy,
    pub schedule: Option<ScheduleOptions>,
    pub listeners: Vec<AppEventListener>,
}

/// Arms and disarms triggers.
pub struct TriggerArming {
    hooks: Arc<dyn TriggerHookExecutor>,
    queue: Arc<dyn QueueManager>,
    app_events: Arc<AppEventRoutingService>,
    flows: Arc<dyn FlowRepository>,
    lock: Arc<dyn DistributedLock>,
    reporter: Arc<dyn ExceptionReporter>,
    polling_interval_minutes: u32,
}

impl TriggerArming {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hooks: Arc<dyn TriggerHookExecutor>,
        queue: Arc<dyn QueueManager>,
        app_events: Arc<AppEventRoutingService>,
        flows: Arc<dyn FlowRepository>,
        lock: Arc<dyn DistributedLock>,
        reporter: Arc<dyn ExceptionReporter>,
        polling_interval_minutes: u32,
    ) -> Self {
        Self {
            hooks,
            queue,
            app_events,
            flows,
            lock,
            reporter,
            polling_interval_minutes,
        }
    }

    /// Schedule used by polling triggers whose hook proposed none.
    ///
    /// Every edition reads the same interval setting.
    pub fn default_polling_schedule(&self) -> ScheduleOptions {
        ScheduleOptions {
            cron_expression: polling_cron(self.polling_interval_minutes),
            timezone: DEFAULT_TIMEZONE.to_string(),
            failure_count: 0,
        }
    }

    /// Run `ON_ENABLE` and arm the trigger.
    ///
    /// Returns `None` without arming anything if the hook did not report
    /// success.
    pub async fn enable(
        &self,
        project_id: &str,
        version: &FlowVersion,
        simulate: bool,
    ) -> Result<Option<TriggerArmingRecord>> {
        let response = self
            .hooks
            .execute(TriggerHookType::OnEnable, project_id, version, simulate)
            .await?;

        if !response.success {
            info!(
                flow_version_id = %version.id,
                message = response.message.as_deref().unwrap_or(""),
                "Trigger enable hook did not succeed, nothing armed"
            );
            return Ok(None);
        }

        let mut record = TriggerArmingRecord {
            flow_version_id: version.id.clone(),
            strategy: version.trigger.strategy.clone(),
            schedule: None,
            listeners: Vec::new(),
        };

        match &version.trigger.strategy {
            TriggerStrategy::AppWebhook => {
                for request in response.listeners {
                    let listener = AppEventListener {
                        project_id: project_id.to_string(),
                        flow_id: version.flow_id.clone(),
                        app_name: version.trigger.block_name.clone(),
                        event: request.event,
                        identifier_value: request.identifier_value,
                    };
                    self.app_events.add_listener(listener.clone()).await?;
                    record.listeners.push(listener);
                }
            }
            TriggerStrategy::Webhook {
                renewal: Some(WebhookRenewal::Cron { cron_expression }),
            } => {
                let schedule = ScheduleOptions {
                    cron_expression: cron_expression.clone(),
                    timezone: DEFAULT_TIMEZONE.to_string(),
                    failure_count: 0,
                };
                self.add_repeating(
                    project_id,
                    version,
                    RepeatableJobType::RenewWebhook,
                    &schedule,
                )
                .await?;
                record.schedule = Some(schedule);
            }
            TriggerStrategy::Webhook { renewal: None } => {}
            TriggerStrategy::Polling => {
                let schedule = match response.schedule {
                    Some(proposed) => {
                        schedule::validate(&proposed.cron_expression, &proposed.timezone)?;
                        ScheduleOptions {
                            cron_expression: proposed.cron_expression,
                            timezone: proposed.timezone,
                            failure_count: 0,
                        }
                    }
                    None => self.default_polling_schedule(),
                };
                self.add_repeating(
                    project_id,
                    version,
                    RepeatableJobType::ExecuteTrigger,
                    &schedule,
                )
                .await?;
                record.schedule = Some(schedule);
            }
        }

        if version.trigger.strategy == TriggerStrategy::Polling {
            self.record_schedule(&version.flow_id, record.schedule.clone())
                .await?;
        }

        info!(
            flow_version_id = %version.id,
            strategy = ?version.trigger.strategy,
            "Trigger enabled"
        );
        Ok(Some(record))
    }

    /// Run `ON_DISABLE` and tear the trigger down.
    ///
    /// Teardown runs whatever the hook does. A hook error is reported and
    /// then returned, unless `ignore_error` is set, in which case this
    /// returns `Ok(None)`.
    ///
    /// The flow's recorded schedule is cleared once teardown succeeds, even
    /// when the hook failed.
    pub async fn disable(
        &self,
        project_id: &str,
        version: &FlowVersion,
        simulate: bool,
        ignore_error: bool,
    ) -> Result<Option<TriggerHookResponse>> {
        self.run_disable(project_id, version, simulate, ignore_error, true)
            .await
    }

    /// [`disable`](Self::disable) without touching the flow record.
    ///
    /// For callers that already hold the flow lock.
    pub(crate) async fn disarm(
        &self,
        project_id: &str,
        version: &FlowVersion,
        simulate: bool,
        ignore_error: bool,
    ) -> Result<Option<TriggerHookResponse>> {
        self.run_disable(project_id, version, simulate, ignore_error, false)
            .await
    }

    async fn run_disable(
        &self,
        project_id: &str,
        version: &FlowVersion,
        simulate: bool,
        ignore_error: bool,
        clear_schedule: bool,
    ) -> Result<Option<TriggerHookResponse>> {
        let hook_result = self
            .hooks
            .execute(TriggerHookType::OnDisable, project_id, version, simulate)
            .await;

        let teardown = match self.teardown(project_id, version).await {
            Ok(()) if clear_schedule => self.record_schedule(&version.flow_id, None).await,
            other => other,
        };

        match hook_result {
            Ok(response) => {
                teardown?;
                info!(flow_version_id = %version.id, "Trigger disabled");
                Ok(Some(response))
            }
            Err(e) => {
                self.reporter.report(
                    "trigger.disable",
                    &format!("ON_DISABLE failed for {}: {}", version.id, e),
                );
                teardown?;
                if ignore_error {
                    warn!(
                        flow_version_id = %version.id,
                        error = %e,
                        "Ignoring trigger disable hook failure"
                    );
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Store `schedule` on the flow, resetting its failure counter.
    ///
    /// A flow that no longer exists is left alone.
    async fn record_schedule(
        &self,
        flow_id: &str,
        schedule: Option<ScheduleOptions>,
    ) -> Result<()> {
        with_lock(self.lock.as_ref(), flow_id, FLOW_LOCK_TIMEOUT, move || async move {
            let Some(mut flow) = self.flows.get_flow(flow_id).await? else {
                debug!(flow_id = %flow_id, "Flow gone, schedule not recorded");
                return Ok(());
            };
            if flow.schedule == schedule {
                return Ok(());
            }
            flow.schedule = schedule;
            self.flows.save_flow(&flow).await
        })
        .await
    }

    async fn teardown(&self, project_id: &str, version: &FlowVersion) -> Result<()> {
        match &version.trigger.strategy {
            TriggerStrategy::AppWebhook => {
                self.app_events
                    .delete_listeners(project_id, &version.flow_id)
                    .await?;
            }
            TriggerStrategy::Webhook {
                renewal: Some(WebhookRenewal::Cron { .. }),
            }
            | TriggerStrategy::Polling => {
                self.queue.remove_repeating_job(&version.id).await?;
            }
            TriggerStrategy::Webhook { renewal: None } => {}
        }
        debug!(flow_version_id = %version.id, "Trigger torn down");
        Ok(())
    }

    async fn add_repeating(
        &self,
        project_id: &str,
        version: &FlowVersion,
        job_type: RepeatableJobType,
        schedule: &ScheduleOptions,
    ) -> Result<bool> {
        self.queue
            .add(AddJobRequest::Repeating {
                id: version.id.clone(),
                data: RepeatingJobData {
                    project_id: project_id.to_string(),
                    flow_version_id: version.id.clone(),
                    flow_id: version.flow_id.clone(),
                    job_type,
                    schedule_options: schedule.clone(),
                },
                schedule: schedule.clone(),
            })
            .await
    }
}
