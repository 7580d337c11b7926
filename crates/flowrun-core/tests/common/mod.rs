// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowrun-core integration tests.
//!
//! Provides [`TestCore`], the full set of services wired over in-memory
//! collaborators, plus recording fakes for the external seams.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use flowrun_core::app_event::{AppEventRoutingService, MemoryAppEventListenerStore};
use flowrun_core::config::Edition;
use flowrun_core::error::{Error, Result};
use flowrun_core::exception::ExceptionReporter;
use flowrun_core::flow_run::{
    BroadcastEventSink, ExecutionEvent, FlowRunService, FlowRunSideEffects, StaticPlanProvider,
};
use flowrun_core::job::{AddJobRequest, QueueName, QueuedJob, ScheduleOptions};
use flowrun_core::lock::MemoryLock;
use flowrun_core::model::{
    Flow, FlowStatus, FlowVersion, FlowVersionState, TriggerSource, TriggerStrategy,
};
use flowrun_core::pubsub::MemoryPubSub;
use flowrun_core::queue::{MemoryQueueManager, QueueManager};
use flowrun_core::rate_limiter::RateLimiter;
use flowrun_core::store::{
    FlowRepository, MemoryExecutionLogs, MemoryFlowRepository, MemoryFlowRunRepository,
};
use flowrun_core::trigger::{
    TriggerArming, TriggerFailureTracker, TriggerHookExecutor, TriggerHookResponse,
    TriggerHookType,
};
use flowrun_core::webhook_response::WebhookResponseWatcher;
use flowrun_core::worker_api::{EngineTokenIssuer, WorkerApi};

pub const PROJECT_ID: &str = "proj-1";
pub const TOKEN_SECRET: &str = "test-secret";

/// Hook executor that records calls and answers with a configured response.
#[derive(Default)]
pub struct RecordingHookExecutor {
    calls: Mutex<Vec<(TriggerHookType, String, bool)>>,
    enable_response: Mutex<Option<TriggerHookResponse>>,
    fail_disable: Mutex<bool>,
}

impl RecordingHookExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed every enable with `response`.
    pub fn respond_to_enable(&self, response: TriggerHookResponse) {
        *self
            .enable_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(response);
    }

    /// Make every `ON_DISABLE` call fail.
    pub fn fail_disable(&self) {
        *self
            .fail_disable
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn calls(&self) -> Vec<(TriggerHookType, String, bool)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TriggerHookExecutor for RecordingHookExecutor {
    async fn execute(
        &self,
        hook: TriggerHookType,
        _project_id: &str,
        flow_version: &FlowVersion,
        simulate: bool,
    ) -> Result<TriggerHookResponse> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((hook, flow_version.id.clone(), simulate));

        match hook {
            TriggerHookType::OnEnable => Ok(self
                .enable_response
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or(TriggerHookResponse {
                    success: true,
                    ..Default::default()
                })),
            TriggerHookType::OnDisable => {
                if *self
                    .fail_disable
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                {
                    Err(Error::Hook("engine unavailable".to_string()))
                } else {
                    Ok(TriggerHookResponse {
                        success: true,
                        ..Default::default()
                    })
                }
            }
        }
    }
}

/// Rate limiter that throttles every job and keeps the deferred ones.
#[derive(Default)]
pub struct ThrottlingRateLimiter {
    deferred: Mutex<Vec<AddJobRequest>>,
}

impl ThrottlingRateLimiter {
    pub fn deferred(&self) -> Vec<AddJobRequest> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RateLimiter for ThrottlingRateLimiter {
    async fn should_throttle(&self, _project_id: &str, _queue: QueueName) -> Result<bool> {
        Ok(true)
    }

    async fn defer(&self, job: AddJobRequest) -> Result<()> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}

/// Exception reporter that keeps every report.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExceptionReporter for RecordingReporter {
    fn report(&self, context: &str, message: &str) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((context.to_string(), message.to_string()));
    }
}

/// Queue that refuses every job, as a rate-limited backend would.
pub struct RejectingQueue;

#[async_trait]
impl QueueManager for RejectingQueue {
    fn backend(&self) -> &'static str {
        "rejecting"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn add(&self, _job: AddJobRequest) -> Result<bool> {
        Ok(false)
    }

    async fn poll(&self, _queue: QueueName) -> Result<Option<QueuedJob>> {
        Ok(None)
    }

    async fn remove_repeating_job(&self, _flow_version_id: &str) -> Result<()> {
        Ok(())
    }

    async fn find_jobs_older_than(&self, _older_than: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove_job(&self, _queue: QueueName, _job_id: &str) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Every service wired over in-memory collaborators.
pub struct TestCore {
    pub flows: Arc<MemoryFlowRepository>,
    pub runs: Arc<MemoryFlowRunRepository>,
    pub logs: Arc<MemoryExecutionLogs>,
    pub memory_queue: Arc<MemoryQueueManager>,
    pub queue: Arc<dyn QueueManager>,
    pub hooks: Arc<RecordingHookExecutor>,
    pub reporter: Arc<RecordingReporter>,
    pub listeners: Arc<MemoryAppEventListenerStore>,
    pub lock: Arc<MemoryLock>,
    pub events: Arc<BroadcastEventSink>,
    pub flow_runs: FlowRunService,
    pub app_events: Arc<AppEventRoutingService>,
    pub arming: Arc<TriggerArming>,
    pub failures: Arc<TriggerFailureTracker>,
    pub watcher: Arc<WebhookResponseWatcher>,
    pub worker_api: WorkerApi,
}

/// Options for [`TestCore::with_options`].
pub struct TestCoreOptions {
    pub edition: Edition,
    pub failure_threshold: u32,
    pub polling_interval_minutes: u32,
    pub reject_jobs: bool,
}

impl Default for TestCoreOptions {
    fn default() -> Self {
        Self {
            edition: Edition::Community,
            failure_threshold: 3,
            polling_interval_minutes: 5,
            reject_jobs: false,
        }
    }
}

impl TestCore {
    pub fn new() -> Self {
        Self::with_options(TestCoreOptions::default())
    }

    pub fn with_options(options: TestCoreOptions) -> Self {
        let flows = Arc::new(MemoryFlowRepository::new());
        let runs = Arc::new(MemoryFlowRunRepository::new());
        let logs = Arc::new(MemoryExecutionLogs::new());
        let memory_queue = Arc::new(MemoryQueueManager::new(flows.clone(), runs.clone()));
        let queue: Arc<dyn QueueManager> = if options.reject_jobs {
            Arc::new(RejectingQueue)
        } else {
            memory_queue.clone()
        };
        let hooks = Arc::new(RecordingHookExecutor::new());
        let reporter = Arc::new(RecordingReporter::default());
        let listeners = Arc::new(MemoryAppEventListenerStore::new());
        let lock = Arc::new(MemoryLock::new());
        let events = Arc::new(BroadcastEventSink::default());

        let flow_runs = FlowRunService::new(
            flows.clone(),
            runs.clone(),
            logs.clone(),
            Arc::new(StaticPlanProvider::default()),
            FlowRunSideEffects::new(queue.clone(), events.clone()),
            options.edition,
        );
        let app_events = Arc::new(AppEventRoutingService::new(listeners.clone(), queue.clone()));
        let arming = Arc::new(TriggerArming::new(
            hooks.clone(),
            queue.clone(),
            app_events.clone(),
            flows.clone(),
            lock.clone(),
            reporter.clone(),
            options.polling_interval_minutes,
        ));
        let failures = Arc::new(TriggerFailureTracker::new(
            flows.clone(),
            arming.clone(),
            lock.clone(),
            options.failure_threshold,
        ));
        let watcher = Arc::new(WebhookResponseWatcher::with_server_id(
            "server-test",
            Arc::new(MemoryPubSub::new()),
            Duration::from_secs(5),
        ));
        let worker_api = WorkerApi::new(
            queue.clone(),
            EngineTokenIssuer::new(TOKEN_SECRET, Duration::from_secs(300)),
            flows.clone(),
            flow_runs.clone(),
            arming.clone(),
            failures.clone(),
            watcher.clone(),
        );

        Self {
            flows,
            runs,
            logs,
            memory_queue,
            queue,
            hooks,
            reporter,
            listeners,
            lock,
            events,
            flow_runs,
            app_events,
            arming,
            failures,
            watcher,
            worker_api,
        }
    }

    /// Subscribe to execution events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Store an enabled flow with a published version using `strategy`.
    pub async fn seed_flow(&self, flow_id: &str, strategy: TriggerStrategy) -> FlowVersion {
        let version = FlowVersion {
            id: format!("{}-v1", flow_id),
            flow_id: flow_id.to_string(),
            state: FlowVersionState::Locked,
            trigger: TriggerSource {
                block_name: "slack".to_string(),
                trigger_name: "new_message".to_string(),
                strategy,
            },
        };
        self.flows.insert_version(version.clone()).await;
        self.flows
            .save_flow(&Flow {
                id: flow_id.to_string(),
                project_id: PROJECT_ID.to_string(),
                status: FlowStatus::Enabled,
                published_version_id: Some(version.id.clone()),
                schedule: None,
            })
            .await
            .expect("save flow");
        version
    }

    /// Overwrite the schedule recorded on a flow, e.g. to seed a failure count.
    pub async fn set_schedule(&self, flow_id: &str, schedule: ScheduleOptions) {
        let mut flow = self
            .flows
            .get_flow(flow_id)
            .await
            .expect("get flow")
            .expect("flow exists");
        flow.schedule = Some(schedule);
        self.flows.save_flow(&flow).await.expect("save flow");
    }
}
