// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-process in-memory queue backend.
//!
//! Each queue name owns a list guarded by one mutex. The mutex is only held
//! for the synchronous list mutation and never across an `.await`.
//!
//! Recurring jobs get their first fire time when they are inserted. On
//! dequeue, the next occurrence is inserted before the dequeued job is
//! handed back.
//!
//! This backend must not be used with more than one server instance.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use super::QueueManager;
use crate::error::Result;
use crate::flow_run::side_effects::delayed_resume_job;
use crate::job::{AddJobRequest, QueueName, QueuedJob, RepeatableJobType, RepeatingJobData};
use crate::schedule::ScheduleCalculator;
use crate::store::{FlowRepository, FlowRunRepository};

/// One mutex-guarded job list.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryJobQueue {
    fn jobs(&self) -> MutexGuard<'_, Vec<QueuedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job. Returns `false` if a job with the same id is present.
    ///
    /// A job carrying a schedule is stored with its first fire time at or
    /// after `now`.
    pub fn add(&self, mut job: QueuedJob, now: DateTime<Utc>) -> Result<bool> {
        if let Some(schedule) = &job.schedule {
            let calc = ScheduleCalculator::new(&schedule.cron_expression, &schedule.timezone)?;
            job.next_fire_at = Some(calc.first_fire_at(now)?.timestamp());
        }

        let mut jobs = self.jobs();
        if jobs.iter().any(|j| j.id == job.id) {
            return Ok(false);
        }
        jobs.push(job);
        Ok(true)
    }

    /// Remove and return the first job due at `now`.
    pub fn poll(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let now_secs = now.timestamp();
        let mut jobs = self.jobs();
        let Some(index) = jobs.iter().position(|j| j.is_due(now_secs)) else {
            return Ok(None);
        };
        let job = jobs.remove(index);

        if let Some(schedule) = &job.schedule {
            let calc = ScheduleCalculator::new(&schedule.cron_expression, &schedule.timezone)?;
            let fired_at = job
                .next_fire_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or(now);
            let next = calc.next_fire_after(fired_at)?;
            jobs.push(QueuedJob {
                next_fire_at: Some(next.timestamp()),
                created_at: now,
                ..job.clone()
            });
        }

        Ok(Some(job))
    }

    /// Delete a job by id.
    pub fn remove(&self, id: &str) -> bool {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        jobs.len() != before
    }

    /// Ids of jobs created before `older_than`.
    pub fn ids_created_before(&self, older_than: DateTime<Utc>) -> Vec<String> {
        self.jobs()
            .iter()
            .filter(|j| j.created_at < older_than)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Snapshot of a job by id.
    pub fn get(&self, id: &str) -> Option<QueuedJob> {
        self.jobs().iter().find(|j| j.id == id).cloned()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`QueueManager`].
pub struct MemoryQueueManager {
    one_time: MemoryJobQueue,
    scheduled: MemoryJobQueue,
    webhook: MemoryJobQueue,
    flows: Arc<dyn FlowRepository>,
    runs: Arc<dyn FlowRunRepository>,
}

impl MemoryQueueManager {
    /// Create a manager with one empty list per queue name.
    pub fn new(flows: Arc<dyn FlowRepository>, runs: Arc<dyn FlowRunRepository>) -> Self {
        Self {
            one_time: MemoryJobQueue::default(),
            scheduled: MemoryJobQueue::default(),
            webhook: MemoryJobQueue::default(),
            flows,
            runs,
        }
    }

    /// Access one queue's list directly.
    pub fn queue(&self, name: QueueName) -> &MemoryJobQueue {
        match name {
            QueueName::OneTime => &self.one_time,
            QueueName::Scheduled => &self.scheduled,
            QueueName::Webhook => &self.webhook,
        }
    }

    /// Enqueue as if the current time were `now`.
    pub fn add_at(&self, job: AddJobRequest, now: DateTime<Utc>) -> Result<bool> {
        let queue = job.queue_name();
        let added = self.queue(queue).add(job.into_queued(now), now)?;
        Ok(added)
    }

    /// Poll as if the current time were `now`.
    pub fn poll_at(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        self.queue(queue).poll(now)
    }

    async fn rehydrate_repeating_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut restored = 0;
        for flow in self.flows.list_enabled_with_schedule().await? {
            let (Some(flow_version_id), Some(schedule)) =
                (flow.published_version_id.clone(), flow.schedule.clone())
            else {
                continue;
            };
            let job = AddJobRequest::Repeating {
                id: flow_version_id.clone(),
                data: RepeatingJobData {
                    project_id: flow.project_id.clone(),
                    flow_version_id,
                    flow_id: flow.id.clone(),
                    job_type: RepeatableJobType::ExecuteTrigger,
                    schedule_options: schedule.clone(),
                },
                schedule,
            };
            if self.add_at(job, now)? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn rehydrate_delayed_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut restored = 0;
        for run in self.runs.list_paused_with_resume_time().await? {
            if let Some(job) = delayed_resume_job(&run, now)
                && self.add_at(job, now)?
            {
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[async_trait]
impl QueueManager for MemoryQueueManager {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        let now = Utc::now();
        let repeating = self.rehydrate_repeating_jobs(now).await?;
        let delayed = self.rehydrate_delayed_jobs(now).await?;
        info!(
            repeating = repeating,
            delayed = delayed,
            "Memory queue re-hydrated"
        );
        Ok(())
    }

    async fn add(&self, job: AddJobRequest) -> Result<bool> {
        let id = job.id().to_string();
        let queue = job.queue_name();
        let added = self.add_at(job, Utc::now())?;
        debug!(job_id = %id, queue = %queue, added = added, "Memory job add");
        Ok(added)
    }

    async fn poll(&self, queue: QueueName) -> Result<Option<QueuedJob>> {
        self.poll_at(queue, Utc::now())
    }

    async fn remove_repeating_job(&self, flow_version_id: &str) -> Result<()> {
        let removed = self.queue(QueueName::Scheduled).remove(flow_version_id);
        debug!(
            flow_version_id = %flow_version_id,
            removed = removed,
            "Memory repeating job removal"
        );
        Ok(())
    }

    async fn find_jobs_older_than(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .queue(QueueName::OneTime)
            .ids_created_before(older_than))
    }

    async fn remove_job(&self, queue: QueueName, job_id: &str) -> Result<()> {
        self.queue(queue).remove(job_id);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
