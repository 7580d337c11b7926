// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background sweeper for stale one-time jobs and runs.
//!
//! Each cycle:
//! 1. Removes one-time jobs enqueued before the horizon (scheduled and
//!    webhook queues are never swept)
//! 2. Marks runs still `SCHEDULED` past the horizon as `TIMEOUT`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::flow_run::FlowRunService;
use crate::job::QueueName;
use crate::queue::QueueManager;

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Whether sweeping is enabled.
    pub enabled: bool,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Age after which a one-time job or scheduled run is stale.
    pub max_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub jobs_removed: usize,
    pub runs_timed_out: usize,
}

/// Background worker that sweeps stale jobs and runs.
pub struct Sweeper {
    queue: Arc<dyn QueueManager>,
    flow_runs: FlowRunService,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(queue: Arc<dyn QueueManager>, flow_runs: FlowRunService, config: SweeperConfig) -> Self {
        Self {
            queue,
            flow_runs,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Stale job sweeper disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Stale job sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stale job sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to sweep stale jobs");
                    }
                }
            }
        }

        info!("Stale job sweeper stopped");
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut summary = SweepSummary::default();

        for job_id in self.queue.find_jobs_older_than(cutoff).await? {
            match self.queue.remove_job(QueueName::OneTime, &job_id).await {
                Ok(()) => summary.jobs_removed += 1,
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove stale job"),
            }
        }

        summary.runs_timed_out = self.flow_runs.cleanup_stale_runs(cutoff).await?;

        if summary.jobs_removed > 0 || summary.runs_timed_out > 0 {
            info!(
                jobs_removed = summary.jobs_removed,
                runs_timed_out = summary.runs_timed_out,
                "Swept stale jobs"
            );
        } else {
            debug!("No stale jobs found");
        }

        Ok(summary)
    }
}
