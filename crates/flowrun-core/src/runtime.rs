// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for flowrun-core.
//!
//! [`FlowRunRuntime`] wires the queue backend, the flow-run lifecycle,
//! trigger arming, app event routing, the webhook response watcher and the
//! worker boundary together, and runs the background tasks.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowrun_core::config::Config;
//! use flowrun_core::runtime::FlowRunRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = FlowRunRuntime::builder()
//!         .config(Config::from_env()?)
//!         .flows(Arc::new(MyFlowRepository::new()))
//!         .hooks(Arc::new(MyEngineClient::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let job = runtime.worker_api().poll(QueueName::OneTime).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Collaborators that are not supplied default to their in-memory
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app_event::{AppEventListenerStore, AppEventRoutingService, MemoryAppEventListenerStore};
use crate::config::{Config, QueueMode};
use crate::exception::{ExceptionReporter, TracingExceptionReporter};
use crate::flow_run::{
    BroadcastEventSink, ExecutionEventSink, FlowRunService, FlowRunSideEffects,
    ProjectPlanProvider, StaticPlanProvider,
};
use crate::lock::{DistributedLock, MemoryLock, RedisLock};
use crate::pubsub::{MemoryPubSub, PubSub, RedisPubSub};
use crate::queue::{MemoryQueueManager, QueueManager, RedisQueueManager, RedisQueueOptions};
use crate::rate_limiter::{NoopRateLimiter, RateLimiter};
use crate::store::{
    ExecutionLogs, FlowRepository, FlowRunRepository, MemoryExecutionLogs, MemoryFlowRepository,
    MemoryFlowRunRepository,
};
use crate::sweeper::{Sweeper, SweeperConfig};
use crate::trigger::{DetachedHookExecutor, TriggerArming, TriggerFailureTracker, TriggerHookExecutor};
use crate::webhook_response::WebhookResponseWatcher;
use crate::worker_api::{EngineTokenIssuer, WorkerApi};

/// Lease of a Redis flow lock before it expires on its own.
const REDIS_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Builder for creating a [`FlowRunRuntime`].
#[derive(Default)]
pub struct FlowRunRuntimeBuilder {
    config: Option<Config>,
    flows: Option<Arc<dyn FlowRepository>>,
    runs: Option<Arc<dyn FlowRunRepository>>,
    logs: Option<Arc<dyn ExecutionLogs>>,
    plans: Option<Arc<dyn ProjectPlanProvider>>,
    hooks: Option<Arc<dyn TriggerHookExecutor>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    reporter: Option<Arc<dyn ExceptionReporter>>,
    listeners: Option<Arc<dyn AppEventListenerStore>>,
    events: Option<Arc<dyn ExecutionEventSink>>,
}

impl FlowRunRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn flows(mut self, flows: Arc<dyn FlowRepository>) -> Self {
        self.flows = Some(flows);
        self
    }

    pub fn runs(mut self, runs: Arc<dyn FlowRunRepository>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn logs(mut self, logs: Arc<dyn ExecutionLogs>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Set the plan provider used for job priorities.
    ///
    /// Default: every project is on the standard tier.
    pub fn plans(mut self, plans: Arc<dyn ProjectPlanProvider>) -> Self {
        self.plans = Some(plans);
        self
    }

    /// Set the execution engine client that runs trigger hooks.
    ///
    /// Default: [`DetachedHookExecutor`], which fails every hook.
    pub fn hooks(mut self, hooks: Arc<dyn TriggerHookExecutor>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Set the rate limiter consulted by the Redis backend.
    ///
    /// Default: [`NoopRateLimiter`]
    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Default: [`TracingExceptionReporter`]
    pub fn reporter(mut self, reporter: Arc<dyn ExceptionReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn listeners(mut self, listeners: Arc<dyn AppEventListenerStore>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// Set the sink for execution events.
    ///
    /// Default: a [`BroadcastEventSink`] nobody subscribes to.
    pub fn events(mut self, events: Arc<dyn ExecutionEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FlowRunRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        if config.queue_mode == QueueMode::Redis && config.redis_url.is_none() {
            anyhow::bail!("redis_url is required for the redis queue backend");
        }

        let hooks = self.hooks.unwrap_or_else(|| {
            warn!("No trigger hook executor configured; trigger hooks will fail");
            Arc::new(DetachedHookExecutor)
        });

        Ok(FlowRunRuntimeConfig {
            config,
            flows: self
                .flows
                .unwrap_or_else(|| Arc::new(MemoryFlowRepository::new())),
            runs: self
                .runs
                .unwrap_or_else(|| Arc::new(MemoryFlowRunRepository::new())),
            logs: self
                .logs
                .unwrap_or_else(|| Arc::new(MemoryExecutionLogs::new())),
            plans: self
                .plans
                .unwrap_or_else(|| Arc::new(StaticPlanProvider::default())),
            hooks,
            rate_limiter: self.rate_limiter.unwrap_or_else(|| Arc::new(NoopRateLimiter)),
            reporter: self
                .reporter
                .unwrap_or_else(|| Arc::new(TracingExceptionReporter)),
            listeners: self
                .listeners
                .unwrap_or_else(|| Arc::new(MemoryAppEventListenerStore::new())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(BroadcastEventSink::default())),
        })
    }
}

/// Configuration for a [`FlowRunRuntime`].
pub struct FlowRunRuntimeConfig {
    config: Config,
    flows: Arc<dyn FlowRepository>,
    runs: Arc<dyn FlowRunRepository>,
    logs: Arc<dyn ExecutionLogs>,
    plans: Arc<dyn ProjectPlanProvider>,
    hooks: Arc<dyn TriggerHookExecutor>,
    rate_limiter: Arc<dyn RateLimiter>,
    reporter: Arc<dyn ExceptionReporter>,
    listeners: Arc<dyn AppEventListenerStore>,
    events: Arc<dyn ExecutionEventSink>,
}

/// Backend-specific collaborators, chosen once from [`QueueMode`].
struct Backend {
    queue: Arc<dyn QueueManager>,
    pubsub: Arc<dyn PubSub>,
    lock: Arc<dyn DistributedLock>,
}

impl FlowRunRuntimeConfig {
    async fn connect_backend(&self) -> Result<Backend> {
        match self.config.queue_mode {
            QueueMode::Memory => {
                warn!("Using in-memory queue; run a single server instance only");
                Ok(Backend {
                    queue: Arc::new(MemoryQueueManager::new(
                        self.flows.clone(),
                        self.runs.clone(),
                    )),
                    pubsub: Arc::new(MemoryPubSub::new()),
                    lock: Arc::new(MemoryLock::new()),
                })
            }
            QueueMode::Redis => {
                let url = self
                    .config
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("redis_url is required"))?;
                let options = RedisQueueOptions {
                    key_prefix: self.config.redis_key_prefix.clone(),
                    stale_job_max_age: self.config.stale_job_max_age,
                };
                let queue = RedisQueueManager::connect(
                    url,
                    options,
                    self.rate_limiter.clone(),
                    self.reporter.clone(),
                )
                .await?;
                let lock = RedisLock::new(
                    queue.engine().connection(),
                    self.config.redis_key_prefix.clone(),
                    REDIS_LOCK_LEASE,
                );
                let pubsub = RedisPubSub::connect(url).await?;
                info!("Connected to Redis");
                Ok(Backend {
                    queue: Arc::new(queue),
                    pubsub: Arc::new(pubsub),
                    lock: Arc::new(lock),
                })
            }
        }
    }

    /// Start the runtime: initialize the queue, start the response watcher
    /// and spawn the sweeper.
    pub async fn start(self) -> Result<FlowRunRuntime> {
        let backend = self.connect_backend().await?;
        let queue = backend.queue;

        queue.init().await?;

        let side_effects = FlowRunSideEffects::new(queue.clone(), self.events.clone());
        let flow_runs = FlowRunService::new(
            self.flows.clone(),
            self.runs.clone(),
            self.logs.clone(),
            self.plans.clone(),
            side_effects,
            self.config.edition,
        );

        let app_events = Arc::new(AppEventRoutingService::new(
            self.listeners.clone(),
            queue.clone(),
        ));
        let arming = Arc::new(TriggerArming::new(
            self.hooks.clone(),
            queue.clone(),
            app_events.clone(),
            self.flows.clone(),
            backend.lock.clone(),
            self.reporter.clone(),
            self.config.polling_interval_minutes,
        ));
        let failures = Arc::new(TriggerFailureTracker::new(
            self.flows.clone(),
            arming.clone(),
            backend.lock,
            self.config.trigger_failure_threshold,
        ));

        // Response watcher
        let watcher = Arc::new(WebhookResponseWatcher::new(
            backend.pubsub,
            self.config.webhook_timeout,
        ));
        let watcher_shutdown = Arc::new(Notify::new());
        let watcher_handle = watcher.start(watcher_shutdown.clone()).await?;

        let worker_api = Arc::new(WorkerApi::new(
            queue.clone(),
            EngineTokenIssuer::new(
                &self.config.engine_token_secret,
                self.config.engine_token_ttl,
            ),
            self.flows.clone(),
            flow_runs.clone(),
            arming.clone(),
            failures,
            watcher.clone(),
        ));

        // Sweeper
        let sweeper = Sweeper::new(
            queue.clone(),
            flow_runs.clone(),
            SweeperConfig {
                enabled: true,
                poll_interval: self.config.sweep_interval,
                max_age: self.config.stale_job_max_age,
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        info!(
            backend = queue.backend(),
            server_id = %watcher.server_id(),
            edition = ?self.config.edition,
            "FlowRunRuntime started"
        );

        Ok(FlowRunRuntime {
            queue,
            flow_runs,
            arming,
            app_events,
            watcher,
            worker_api,
            events: self.events,
            watcher_handle,
            sweeper_handle,
            watcher_shutdown,
            sweeper_shutdown,
        })
    }
}

/// A running flowrun core that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FlowRunRuntime {
    queue: Arc<dyn QueueManager>,
    flow_runs: FlowRunService,
    arming: Arc<TriggerArming>,
    app_events: Arc<AppEventRoutingService>,
    watcher: Arc<WebhookResponseWatcher>,
    worker_api: Arc<WorkerApi>,
    events: Arc<dyn ExecutionEventSink>,
    watcher_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    watcher_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
}

impl FlowRunRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FlowRunRuntimeBuilder {
        FlowRunRuntimeBuilder::new()
    }

    pub fn queue(&self) -> &Arc<dyn QueueManager> {
        &self.queue
    }

    pub fn flow_runs(&self) -> &FlowRunService {
        &self.flow_runs
    }

    pub fn arming(&self) -> &Arc<TriggerArming> {
        &self.arming
    }

    pub fn app_events(&self) -> &Arc<AppEventRoutingService> {
        &self.app_events
    }

    pub fn watcher(&self) -> &Arc<WebhookResponseWatcher> {
        &self.watcher
    }

    pub fn worker_api(&self) -> &Arc<WorkerApi> {
        &self.worker_api
    }

    pub fn events(&self) -> &Arc<dyn ExecutionEventSink> {
        &self.events
    }

    /// Whether the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.watcher_handle.is_finished() && !self.sweeper_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the response watcher and the sweeper to stop, then waits for
    /// them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("FlowRunRuntime shutting down...");

        self.watcher_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.watcher_handle.await {
            error!("Webhook response watcher task panicked: {}", e);
        }

        if let Err(e) = self.sweeper_handle.await {
            error!("Sweeper task panicked: {}", e);
        }

        info!(
            pending_responses = self.watcher.pending_count(),
            "FlowRunRuntime shutdown complete"
        );
        Ok(())
    }
}
