// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the flow run lifecycle.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};

use common::{PROJECT_ID, TestCore, TestCoreOptions};
use flowrun_core::flow_run::{
    ExecutionEvent, PauseParams, RetryStrategy, StartParams, UpdateStatusParams,
};
use flowrun_core::job::{
    ExecutionType, JobData, JobPriority, OneTimeJobData, ProgressUpdateType, QueueName,
};
use flowrun_core::model::{FlowRunStatus, PauseMetadata, TriggerStrategy};
use flowrun_core::queue::QueueManager;
use flowrun_core::store::{FlowRepository, FlowRunRepository};

async fn next_one_time(core: &TestCore) -> (String, JobPriority, OneTimeJobData) {
    let job = core
        .queue
        .poll(QueueName::OneTime)
        .await
        .unwrap()
        .expect("one-time job");
    match job.data {
        JobData::OneTime(data) => (job.id, job.priority, data),
        other => panic!("unexpected payload {:?}", other),
    }
}

fn delay_pause(run_id: &str, resume_in: ChronoDuration) -> PauseParams {
    PauseParams {
        run_id: run_id.to_string(),
        pause_metadata: Some(PauseMetadata::Delay {
            resume_date_time: Utc::now() + resume_in,
            handler_id: None,
            progress_update_type: ProgressUpdateType::None,
        }),
        tasks: Some(3),
        duration_ms: Some(120),
        logs_file_id: None,
    }
}

#[tokio::test]
async fn test_begin_schedules_run_and_enqueues_job() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let mut events = core.subscribe_events();

    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(run.status, FlowRunStatus::Scheduled);
    assert_eq!(run.flow_id, "flow-1");

    let (job_id, priority, data) = next_one_time(&core).await;
    assert_eq!(job_id, data.execution_correlation_id);
    assert_eq!(priority, JobPriority::Low);
    assert_eq!(data.run_id, run.id);
    assert_eq!(data.execution_type, ExecutionType::Begin);
    assert_eq!(data.payload, json!({"n": 1}));

    assert!(matches!(
        events.try_recv().unwrap(),
        ExecutionEvent::RunStarted { run_id, .. } if run_id == run.id
    ));
}

#[tokio::test]
async fn test_synchronous_caller_gets_medium_priority() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;

    core.flow_runs
        .start(
            StartParams::begin(PROJECT_ID, &version.id, Value::Null)
                .with_synchronous_handler("server-a", ProgressUpdateType::WebhookResponse),
        )
        .await
        .unwrap();

    let (_, priority, data) = next_one_time(&core).await;
    assert_eq!(priority, JobPriority::Medium);
    assert_eq!(data.synchronous_handler_id.as_deref(), Some("server-a"));
    assert_eq!(data.progress_update_type, ProgressUpdateType::WebhookResponse);
}

#[tokio::test]
async fn test_rejected_enqueue_ignores_run() {
    let core = TestCore::with_options(TestCoreOptions {
        reject_jobs: true,
        ..Default::default()
    });
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;

    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    assert_eq!(run.status, FlowRunStatus::Ignored);
    assert!(run.finished_at.is_some());
    let stored = core.runs.get(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FlowRunStatus::Ignored);
}

#[tokio::test]
async fn test_start_for_other_project_is_not_found() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;

    let err = core
        .flow_runs
        .start(StartParams::begin("other-project", &version.id, Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, "missing-version", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "FLOW_VERSION_NOT_FOUND");
}

#[tokio::test]
async fn test_pause_with_past_resume_time_is_due_immediately() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    let paused = core
        .flow_runs
        .pause(delay_pause(&run.id, ChronoDuration::minutes(-10)))
        .await
        .unwrap();
    assert_eq!(paused.status, FlowRunStatus::Paused);
    assert_eq!(paused.tasks, 3);

    let job = core
        .memory_queue
        .queue(QueueName::Scheduled)
        .get(&run.id)
        .expect("delayed job keyed by run id");
    assert!(job.is_due(Utc::now().timestamp()));

    let polled = core.queue.poll(QueueName::Scheduled).await.unwrap().unwrap();
    assert!(matches!(polled.data, JobData::Delayed(ref d) if d.run_id == run.id));
}

#[tokio::test]
async fn test_pause_with_future_resume_time_waits() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    core.flow_runs
        .pause(delay_pause(&run.id, ChronoDuration::hours(1)))
        .await
        .unwrap();

    assert!(core.queue.poll(QueueName::Scheduled).await.unwrap().is_none());
    assert_eq!(core.memory_queue.queue(QueueName::Scheduled).len(), 1);
}

#[tokio::test]
async fn test_webhook_pause_schedules_nothing() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    core.flow_runs
        .pause(PauseParams {
            run_id: run.id.clone(),
            pause_metadata: Some(PauseMetadata::Webhook {
                request_id: "req-1".to_string(),
                handler_id: None,
                progress_update_type: ProgressUpdateType::None,
            }),
            tasks: None,
            duration_ms: None,
            logs_file_id: None,
        })
        .await
        .unwrap();

    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_pause_requires_metadata() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    let err = core
        .flow_runs
        .pause(PauseParams {
            run_id: run.id,
            pause_metadata: None,
            tasks: None,
            duration_ms: None,
            logs_file_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_terminal_status_is_final_and_stopped_reports_succeeded() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    let mut events = core.subscribe_events();

    let running = core
        .flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Running))
        .await
        .unwrap();
    assert!(running.started_at.is_some());
    assert!(events.try_recv().is_err());

    let stopped = core
        .flow_runs
        .update_status(UpdateStatusParams {
            tasks: Some(7),
            duration_ms: Some(900),
            ..UpdateStatusParams::new(&run.id, FlowRunStatus::Stopped)
        })
        .await
        .unwrap();
    assert_eq!(stopped.status, FlowRunStatus::Stopped);
    assert_eq!(stopped.tasks, 7);
    assert!(stopped.finished_at.is_some());

    assert!(matches!(
        events.try_recv().unwrap(),
        ExecutionEvent::RunFinished { status: FlowRunStatus::Succeeded, .. }
    ));

    let err = core
        .flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Failed))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_resume_carries_handler_and_uses_fresh_correlation_id() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    let (first_job, _, _) = next_one_time(&core).await;

    core.flow_runs
        .pause(PauseParams {
            run_id: run.id.clone(),
            pause_metadata: Some(PauseMetadata::Webhook {
                request_id: "req-1".to_string(),
                handler_id: Some("server-b".to_string()),
                progress_update_type: ProgressUpdateType::WebhookResponse,
            }),
            tasks: None,
            duration_ms: None,
            logs_file_id: None,
        })
        .await
        .unwrap();

    let resumed = core
        .flow_runs
        .resume(&run.id, json!({"approved": true}))
        .await
        .unwrap();
    assert_eq!(resumed.status, FlowRunStatus::Scheduled);
    assert!(resumed.pause_metadata.is_none());

    let (job_id, priority, data) = next_one_time(&core).await;
    assert_ne!(job_id, first_job);
    assert_eq!(priority, JobPriority::Medium);
    assert_eq!(data.execution_type, ExecutionType::Resume);
    assert_eq!(data.synchronous_handler_id.as_deref(), Some("server-b"));
    assert_eq!(data.payload, json!({"approved": true}));
}

#[tokio::test]
async fn test_resume_of_running_run_conflicts() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    let err = core
        .flow_runs
        .resume(&run.id, Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_retry_from_failed_step_resumes_same_version() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    let (first_job, _, _) = next_one_time(&core).await;
    core.flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Failed))
        .await
        .unwrap();

    let retried = core
        .flow_runs
        .retry(&run.id, RetryStrategy::FromFailedStep)
        .await
        .unwrap();

    assert_eq!(retried.id, run.id);
    assert_eq!(retried.flow_version_id, version.id);
    assert!(retried.finished_at.is_none());

    let (job_id, _, data) = next_one_time(&core).await;
    assert_ne!(job_id, first_job);
    assert_eq!(data.execution_type, ExecutionType::Resume);
    assert_eq!(data.flow_version_id, version.id);
}

#[tokio::test]
async fn test_retry_on_latest_version_replays_trigger_output() {
    let core = TestCore::new();
    let old_version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &old_version.id, json!({"a": 1})))
        .await
        .unwrap();
    next_one_time(&core).await;
    core.flow_runs
        .update_status(UpdateStatusParams {
            logs_file_id: Some("logs-1".to_string()),
            ..UpdateStatusParams::new(&run.id, FlowRunStatus::Failed)
        })
        .await
        .unwrap();
    core.logs.record("logs-1", json!({"order": 42})).await;

    // Publish a new version.
    let mut new_version = old_version.clone();
    new_version.id = "flow-1-v2".to_string();
    core.flows.insert_version(new_version.clone()).await;
    let mut flow = core.flows.get_flow("flow-1").await.unwrap().unwrap();
    flow.published_version_id = Some(new_version.id.clone());
    core.flows.save_flow(&flow).await.unwrap();

    let retried = core
        .flow_runs
        .retry(&run.id, RetryStrategy::OnLatestVersion)
        .await
        .unwrap();

    assert_eq!(retried.flow_version_id, "flow-1-v2");
    assert_eq!(retried.status, FlowRunStatus::Scheduled);

    let (_, _, data) = next_one_time(&core).await;
    assert_eq!(data.execution_type, ExecutionType::Begin);
    assert_eq!(data.flow_version_id, "flow-1-v2");
    assert_eq!(data.payload, json!({"order": 42}));
}

#[tokio::test]
async fn test_retry_of_unfinished_run_conflicts() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();

    let err = core
        .flow_runs
        .retry(&run.id, RetryStrategy::FromFailedStep)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_cleanup_times_out_stale_scheduled_runs() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let stale = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    let running = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    core.flow_runs
        .update_status(UpdateStatusParams::new(&running.id, FlowRunStatus::Running))
        .await
        .unwrap();

    let timed_out = core
        .flow_runs
        .cleanup_stale_runs(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();

    assert_eq!(timed_out, 1);
    let stale = core.runs.get(&stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, FlowRunStatus::Timeout);
    let running = core.runs.get(&running.id).await.unwrap().unwrap();
    assert_eq!(running.status, FlowRunStatus::Running);
}

#[tokio::test]
async fn test_cleanup_spares_freshly_retried_old_run() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    next_one_time(&core).await;
    core.flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Failed))
        .await
        .unwrap();

    // The run was created two days ago.
    let mut aged = core.runs.get(&run.id).await.unwrap().unwrap();
    aged.created_at = Utc::now() - ChronoDuration::days(2);
    aged.scheduled_at = Some(aged.created_at);
    core.runs.save(&aged).await.unwrap();

    let retried = core
        .flow_runs
        .retry(&run.id, RetryStrategy::FromFailedStep)
        .await
        .unwrap();
    assert_eq!(retried.status, FlowRunStatus::Scheduled);
    assert!(retried.scheduled_at.unwrap() > Utc::now() - ChronoDuration::minutes(1));

    let timed_out = core
        .flow_runs
        .cleanup_stale_runs(Utc::now() - ChronoDuration::days(1))
        .await
        .unwrap();
    assert_eq!(timed_out, 0);

    let running = core
        .flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.status, FlowRunStatus::Running);
}

#[tokio::test]
async fn test_resumed_run_waits_in_scheduled_until_worker_picks_it_up() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-1", TriggerStrategy::Polling).await;
    let run = core
        .flow_runs
        .start(StartParams::begin(PROJECT_ID, &version.id, Value::Null))
        .await
        .unwrap();
    next_one_time(&core).await;
    core.flow_runs
        .update_status(UpdateStatusParams::new(&run.id, FlowRunStatus::Running))
        .await
        .unwrap();
    core.flow_runs
        .pause(PauseParams {
            run_id: run.id.clone(),
            pause_metadata: Some(PauseMetadata::Webhook {
                request_id: "req-1".to_string(),
                handler_id: None,
                progress_update_type: ProgressUpdateType::None,
            }),
            tasks: None,
            duration_ms: None,
            logs_file_id: None,
        })
        .await
        .unwrap();

    let resumed = core.flow_runs.resume(&run.id, Value::Null).await.unwrap();
    assert_eq!(resumed.status, FlowRunStatus::Scheduled);

    // No worker ever picks up the resume job, so the run goes stale.
    let timed_out = core
        .flow_runs
        .cleanup_stale_runs(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(timed_out, 1);
    let stored = core.runs.get(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FlowRunStatus::Timeout);
}
