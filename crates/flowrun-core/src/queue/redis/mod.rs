// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed queue backend.
//!
//! [`RedisQueueManager`] adapts the raw [`RedisQueueEngine`] to the
//! [`QueueManager`] contract:
//!
//! - Logical priorities map to the engine's native values (2, 3, 4).
//! - One-time and webhook jobs are checked for an existing id before insert.
//! - Every add first asks the [`RateLimiter`]; throttled jobs are handed to
//!   it and reported as not enqueued.
//! - Repeating jobs keep a template under a repeat key. The key is recorded
//!   in a side index by flow version id so it can be removed later. A
//!   missing index entry falls back to a scan of the templates; if that
//!   also fails the drift goes to the [`ExceptionReporter`].
//! - The next instance of a repeating job is derived when the current one is
//!   polled, and only enqueued while its template is still stored. `init`
//!   re-seeds any template left without a pending instance.
//! - Only the one-time queue is ever swept for stale jobs.

pub mod engine;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::QueueManager;
use crate::error::{Error, Result};
use crate::exception::ExceptionReporter;
use crate::job::{AddJobRequest, QueueName, QueuedJob, RepeatingJobData, ScheduleOptions};
use crate::rate_limiter::RateLimiter;
use crate::schedule::ScheduleCalculator;

pub use engine::RedisQueueEngine;

/// Prefix of repeating job instance ids.
const REPEAT_INSTANCE_PREFIX: &str = "repeat:";

/// Side index: flow version id → repeat key.
const REPEAT_INDEX_KEY: &str = "repeat-index";

/// Applied migration counter.
const MIGRATION_VERSION_KEY: &str = "migration-version";

/// Latest migration this build knows about.
const LATEST_MIGRATION: u32 = 1;

/// Options for the distributed backend.
#[derive(Debug, Clone)]
pub struct RedisQueueOptions {
    /// Namespace for every key.
    pub key_prefix: String,
    /// One-time jobs older than this are removed during `init`.
    pub stale_job_max_age: Duration,
}

impl Default for RedisQueueOptions {
    fn default() -> Self {
        Self {
            key_prefix: "flowrun".to_string(),
            stale_job_max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Repeat key for a repeating job.
///
/// Changing the cron expression or timezone yields a different key.
pub fn repeat_key(job_id: &str, schedule: &ScheduleOptions) -> String {
    format!(
        "{}:{}:{}",
        job_id, schedule.cron_expression, schedule.timezone
    )
}

/// Id of the instance of `repeat_key` that fires at `fire_ms`.
pub fn repeat_instance_id(repeat_key: &str, fire_ms: i64) -> String {
    format!("{}{}:{}", REPEAT_INSTANCE_PREFIX, repeat_key, fire_ms)
}

/// Repeat key of a repeating job instance id.
pub fn parse_repeat_instance_id(job_id: &str) -> Option<&str> {
    job_id
        .strip_prefix(REPEAT_INSTANCE_PREFIX)?
        .rsplit_once(':')
        .map(|(key, _)| key)
}

/// Redis-backed [`QueueManager`].
pub struct RedisQueueManager {
    engine: RedisQueueEngine,
    options: RedisQueueOptions,
    rate_limiter: Arc<dyn RateLimiter>,
    reporter: Arc<dyn ExceptionReporter>,
}

impl RedisQueueManager {
    /// Connect to Redis at `url`.
    pub async fn connect(
        url: &str,
        options: RedisQueueOptions,
        rate_limiter: Arc<dyn RateLimiter>,
        reporter: Arc<dyn ExceptionReporter>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, options, rate_limiter, reporter))
    }

    /// Build over an existing connection.
    pub fn new(
        conn: ConnectionManager,
        options: RedisQueueOptions,
        rate_limiter: Arc<dyn RateLimiter>,
        reporter: Arc<dyn ExceptionReporter>,
    ) -> Self {
        let engine = RedisQueueEngine::new(conn, options.key_prefix.clone());
        Self {
            engine,
            options,
            rate_limiter,
            reporter,
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &RedisQueueEngine {
        &self.engine
    }

    async fn index_get(&self, flow_version_id: &str) -> Result<Option<String>> {
        let mut conn = self.engine.connection();
        let key: Option<String> = conn
            .hget(self.engine.global_key(REPEAT_INDEX_KEY), flow_version_id)
            .await?;
        Ok(key)
    }

    async fn index_set(&self, flow_version_id: &str, repeat_key: &str) -> Result<()> {
        let mut conn = self.engine.connection();
        let _: () = conn
            .hset(
                self.engine.global_key(REPEAT_INDEX_KEY),
                flow_version_id,
                repeat_key,
            )
            .await?;
        Ok(())
    }

    async fn index_delete(&self, flow_version_id: &str) -> Result<()> {
        let mut conn = self.engine.connection();
        let _: () = conn
            .hdel(self.engine.global_key(REPEAT_INDEX_KEY), flow_version_id)
            .await?;
        Ok(())
    }

    /// Find a repeat key by scanning every template.
    async fn scan_repeat_key(&self, flow_version_id: &str) -> Result<Option<String>> {
        let repeats = self.engine.list_repeats(QueueName::Scheduled).await?;
        Ok(repeats
            .into_iter()
            .find(|(_, template)| template.data.flow_version_id() == Some(flow_version_id))
            .map(|(key, _)| key))
    }

    /// Delete a template and any pending instance. Returns whether anything
    /// was found.
    async fn remove_repeat(&self, key: &str) -> Result<bool> {
        let had_template = self
            .engine
            .delete_repeat(QueueName::Scheduled, key)
            .await?;

        let prefix = format!("{}{}:", REPEAT_INSTANCE_PREFIX, key);
        let mut removed_instances = 0;
        for id in self
            .engine
            .ids_with_prefix(QueueName::Scheduled, &prefix)
            .await?
        {
            if self.engine.remove(QueueName::Scheduled, &id).await? {
                removed_instances += 1;
            }
        }

        Ok(had_template || removed_instances > 0)
    }

    async fn schedule_instance(
        &self,
        key: &str,
        template: &QueuedJob,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fire_ms = fire_at.timestamp_millis();
        let instance = QueuedJob {
            id: repeat_instance_id(key, fire_ms),
            next_fire_at: Some(fire_at.timestamp()),
            created_at: now,
            ..template.clone()
        };
        self.engine
            .enqueue_repeat_instance(&instance, key, fire_ms, now.timestamp_millis())
            .await
    }

    /// Enqueue the instance following the one just polled.
    async fn schedule_next_instance(
        &self,
        key: &str,
        template: &QueuedJob,
        fired: &QueuedJob,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(schedule) = &template.schedule else {
            return Ok(false);
        };
        let calc = ScheduleCalculator::new(&schedule.cron_expression, &schedule.timezone)?;
        let fired_at = fired
            .next_fire_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(now);
        let next = calc.next_fire_after(fired_at)?;
        self.schedule_instance(key, template, next, now).await
    }

    /// Re-seed templates that have no pending instance.
    ///
    /// An instance is missing when a poller stopped between taking one
    /// instance and enqueueing the next.
    async fn repair_repeats(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut repaired = 0;
        for (key, template) in self.engine.list_repeats(QueueName::Scheduled).await? {
            let prefix = format!("{}{}:", REPEAT_INSTANCE_PREFIX, key);
            if !self
                .engine
                .ids_with_prefix(QueueName::Scheduled, &prefix)
                .await?
                .is_empty()
            {
                continue;
            }
            let Some(schedule) = &template.schedule else {
                continue;
            };
            let calc = ScheduleCalculator::new(&schedule.cron_expression, &schedule.timezone)?;
            if self
                .schedule_instance(&key, &template, calc.first_fire_at(now)?, now)
                .await?
            {
                warn!(repeat_key = %key, "Re-seeded repeating job without pending instance");
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn add_repeating(
        &self,
        id: String,
        data: RepeatingJobData,
        schedule: ScheduleOptions,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let calc = ScheduleCalculator::new(&schedule.cron_expression, &schedule.timezone)?;
        let key = repeat_key(&id, &schedule);
        let flow_version_id = data.flow_version_id.clone();

        // At most one repeating job per flow version.
        if let Some(existing) = self.index_get(&flow_version_id).await? {
            if existing == key
                && self
                    .engine
                    .get_repeat(QueueName::Scheduled, &key)
                    .await?
                    .is_some()
            {
                debug!(flow_version_id = %flow_version_id, "Repeating job already scheduled");
                return Ok(false);
            }
            self.remove_repeat(&existing).await?;
        }

        let template = AddJobRequest::Repeating { id, data, schedule }.into_queued(now);
        self.engine
            .put_repeat(QueueName::Scheduled, &key, &template)
            .await?;
        self.schedule_instance(&key, &template, calc.first_fire_at(now)?, now)
            .await?;
        self.index_set(&flow_version_id, &key).await?;

        debug!(
            flow_version_id = %flow_version_id,
            repeat_key = %key,
            "Repeating job scheduled"
        );
        Ok(true)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.engine.connection();
        let version_key = self.engine.global_key(MIGRATION_VERSION_KEY);
        let applied: Option<u32> = conn.get(&version_key).await?;
        let applied = applied.unwrap_or(0);

        if applied >= LATEST_MIGRATION {
            debug!(version = applied, "Queue migrations up to date");
            return Ok(());
        }

        if applied < 1 {
            let rebuilt = self.rebuild_repeat_index().await?;
            info!(entries = rebuilt, "Migration 1: rebuilt repeat index");
        }

        let _: () = conn.set(&version_key, LATEST_MIGRATION).await?;
        Ok(())
    }

    async fn rebuild_repeat_index(&self) -> Result<usize> {
        let mut rebuilt = 0;
        for (key, template) in self.engine.list_repeats(QueueName::Scheduled).await? {
            if let Some(flow_version_id) = template.data.flow_version_id() {
                self.index_set(flow_version_id, &key).await?;
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    async fn remove_stale_jobs(&self) -> Result<usize> {
        let max_age = chrono::Duration::from_std(self.options.stale_job_max_age)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let ids = self.find_jobs_older_than(Utc::now() - max_age).await?;
        for id in &ids {
            self.engine.remove(QueueName::OneTime, id).await?;
        }
        Ok(ids.len())
    }
}

#[async_trait]
impl QueueManager for RedisQueueManager {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn init(&self) -> Result<()> {
        self.engine.ping().await?;
        self.run_migrations().await?;
        let repaired = self.repair_repeats(Utc::now()).await?;
        let removed = self.remove_stale_jobs().await?;
        info!(
            key_prefix = %self.options.key_prefix,
            repeats_repaired = repaired,
            stale_removed = removed,
            "Redis queue initialized"
        );
        Ok(())
    }

    async fn add(&self, job: AddJobRequest) -> Result<bool> {
        let queue = job.queue_name();
        if self
            .rate_limiter
            .should_throttle(job.project_id(), queue)
            .await?
        {
            debug!(
                job_id = %job.id(),
                project_id = %job.project_id(),
                queue = %queue,
                "Enqueue throttled, deferring"
            );
            self.rate_limiter.defer(job).await?;
            return Ok(false);
        }

        let now = Utc::now();
        match job {
            AddJobRequest::Repeating { id, data, schedule } => {
                self.add_repeating(id, data, schedule, now).await
            }
            other => {
                if self.engine.exists(queue, other.id()).await? {
                    debug!(job_id = %other.id(), queue = %queue, "Job already enqueued");
                    return Ok(false);
                }
                let now_ms = now.timestamp_millis();
                let job = other.into_queued(now);
                let fire_ms = job.next_fire_at.map_or(now_ms, |secs| secs * 1000);
                self.engine.enqueue(&job, fire_ms, now_ms).await
            }
        }
    }

    async fn poll(&self, queue: QueueName) -> Result<Option<QueuedJob>> {
        let now = Utc::now();
        let Some(job) = self.engine.dequeue(queue, now.timestamp_millis()).await? else {
            return Ok(None);
        };

        // The polled job is already off the queue, so a failure to schedule
        // its successor is reported rather than raised. `init` re-seeds it.
        if let Some(key) = parse_repeat_instance_id(&job.id) {
            let next = match self.engine.get_repeat(queue, key).await {
                Ok(Some(template)) => {
                    self.schedule_next_instance(key, &template, &job, now).await
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            if let Err(e) = next {
                warn!(job_id = %job.id, error = %e, "Failed to schedule next repeating instance");
                self.reporter.report(
                    "queue.poll",
                    &format!("Next instance of {} not scheduled: {}", key, e),
                );
            }
        }

        Ok(Some(job))
    }

    async fn remove_repeating_job(&self, flow_version_id: &str) -> Result<()> {
        let key = match self.index_get(flow_version_id).await? {
            Some(key) => Some(key),
            None => {
                warn!(
                    flow_version_id = %flow_version_id,
                    "Repeat index entry missing, scanning templates"
                );
                self.scan_repeat_key(flow_version_id).await?
            }
        };

        let Some(key) = key else {
            self.reporter.report(
                "queue.remove_repeating_job",
                &format!(
                    "No repeating job found for flow version {}",
                    flow_version_id
                ),
            );
            return Ok(());
        };

        if !self.remove_repeat(&key).await? {
            self.reporter.report(
                "queue.remove_repeating_job",
                &format!(
                    "Repeat key {} for flow version {} had no template",
                    key, flow_version_id
                ),
            );
        }
        self.index_delete(flow_version_id).await?;

        debug!(flow_version_id = %flow_version_id, repeat_key = %key, "Repeating job removed");
        Ok(())
    }

    async fn find_jobs_older_than(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        self.engine
            .ids_added_before(QueueName::OneTime, older_than.timestamp_millis())
            .await
    }

    async fn remove_job(&self, queue: QueueName, job_id: &str) -> Result<()> {
        self.engine.remove(queue, job_id).await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.engine.ping().await.is_ok()
    }
}
