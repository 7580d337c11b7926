// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for trigger arming, disarming and failure tracking.

mod common;

use chrono::Utc;
use serde_json::json;

use common::{PROJECT_ID, TestCore, TestCoreOptions};
use flowrun_core::app_event::AppEvent;
use flowrun_core::job::{JobData, QueueName, RepeatableJobType, ScheduleOptions};
use flowrun_core::model::{FlowStatus, TriggerStrategy, WebhookRenewal};
use flowrun_core::store::FlowRepository;
use flowrun_core::trigger::{
    ListenerRequest, ProposedSchedule, TriggerHookResponse, TriggerHookType,
};

#[tokio::test]
async fn test_polling_trigger_without_schedule_uses_default_interval() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    let before = Utc::now().timestamp();

    let record = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap()
        .expect("armed");

    let schedule = record.schedule.expect("schedule");
    assert_eq!(schedule.cron_expression, "*/5 * * * *");
    assert_eq!(schedule.timezone, "UTC");

    let job = core
        .memory_queue
        .queue(QueueName::Scheduled)
        .get(&version.id)
        .expect("repeating job keyed by flow version");
    let fire_at = job.next_fire_at.expect("fire time computed on insert");
    assert!(fire_at >= before);
    assert_eq!(fire_at % 300, 0);

    match job.data {
        JobData::Repeating(data) => {
            assert_eq!(data.job_type, RepeatableJobType::ExecuteTrigger);
            assert_eq!(data.flow_id, "flow-poll");
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_polling_trigger_uses_proposed_schedule() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.hooks.respond_to_enable(TriggerHookResponse {
        success: true,
        schedule: Some(ProposedSchedule {
            cron_expression: "0 9 * * 1-5".to_string(),
            timezone: "Europe/Warsaw".to_string(),
        }),
        ..Default::default()
    });

    let record = core
        .arming
        .enable(PROJECT_ID, &version, true)
        .await
        .unwrap()
        .unwrap();

    let schedule = record.schedule.unwrap();
    assert_eq!(schedule.cron_expression, "0 9 * * 1-5");
    assert_eq!(schedule.timezone, "Europe/Warsaw");
    assert_eq!(
        core.hooks.calls(),
        vec![(TriggerHookType::OnEnable, version.id.clone(), true)]
    );
}

#[tokio::test]
async fn test_invalid_proposed_schedule_arms_nothing() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.hooks.respond_to_enable(TriggerHookResponse {
        success: true,
        schedule: Some(ProposedSchedule {
            cron_expression: "61 * * * *".to_string(),
            timezone: "UTC".to_string(),
        }),
        ..Default::default()
    });

    let err = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "INVALID_SCHEDULE");
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_unsuccessful_enable_hook_arms_nothing() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.hooks.respond_to_enable(TriggerHookResponse {
        success: false,
        message: Some("missing credentials".to_string()),
        ..Default::default()
    });

    let record = core.arming.enable(PROJECT_ID, &version, false).await.unwrap();

    assert!(record.is_none());
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_webhook_with_cron_renewal_schedules_renewal() {
    let core = TestCore::new();
    let version = core
        .seed_flow(
            "flow-hook",
            TriggerStrategy::Webhook {
                renewal: Some(WebhookRenewal::Cron {
                    cron_expression: "0 0 * * *".to_string(),
                }),
            },
        )
        .await;

    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();

    let job = core
        .memory_queue
        .queue(QueueName::Scheduled)
        .get(&version.id)
        .unwrap();
    match job.data {
        JobData::Repeating(data) => {
            assert_eq!(data.job_type, RepeatableJobType::RenewWebhook);
            assert_eq!(data.schedule_options.timezone, "UTC");
        }
        other => panic!("unexpected payload {:?}", other),
    }

    core.arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap();
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_plain_webhook_arms_no_job() {
    let core = TestCore::new();
    let version = core
        .seed_flow("flow-hook", TriggerStrategy::Webhook { renewal: None })
        .await;

    let record = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap()
        .unwrap();

    assert!(record.schedule.is_none());
    assert!(record.listeners.is_empty());
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_app_webhook_registers_and_removes_listeners() {
    let core = TestCore::new();
    let version = core
        .seed_flow("flow-app", TriggerStrategy::AppWebhook)
        .await;
    core.hooks.respond_to_enable(TriggerHookResponse {
        success: true,
        listeners: vec![
            ListenerRequest {
                event: "message".to_string(),
                identifier_value: "T1".to_string(),
            },
            ListenerRequest {
                event: "reaction".to_string(),
                identifier_value: "T1".to_string(),
            },
        ],
        ..Default::default()
    });

    let record = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.listeners.len(), 2);
    assert!(record.listeners.iter().all(|l| l.app_name == "slack"));
    assert_eq!(core.listeners.count().await, 2);

    let summary = core
        .app_events
        .route(AppEvent {
            app_name: "slack".to_string(),
            event: "message".to_string(),
            identifier_value: "T1".to_string(),
            payload: json!({"text": "hello"}),
        })
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(core.memory_queue.queue(QueueName::Webhook).len(), 1);

    core.arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap();
    assert_eq!(core.listeners.count().await, 0);
}

#[tokio::test]
async fn test_disable_with_failing_hook_and_ignore_error_still_tears_down() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();
    core.hooks.fail_disable();

    let response = core
        .arming
        .disable(PROJECT_ID, &version, false, true)
        .await
        .unwrap();

    assert!(response.is_none());
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
    let reports = core.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "trigger.disable");
}

#[tokio::test]
async fn test_disable_with_failing_hook_propagates_after_teardown() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();
    core.hooks.fail_disable();

    let err = core
        .arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "TRIGGER_HOOK_FAILED");
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_disable_without_armed_job_succeeds() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;

    let response = core
        .arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap();

    assert!(response.is_some_and(|r| r.success));
}

async fn armed_polling_flow(core: &TestCore, failure_count: u32) -> String {
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    let record = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap()
        .unwrap();
    let schedule = record.schedule.unwrap();
    if failure_count > 0 {
        core.set_schedule(
            "flow-poll",
            ScheduleOptions {
                failure_count,
                ..schedule
            },
        )
        .await;
    }
    version.id
}

#[tokio::test]
async fn test_enable_records_polling_schedule_on_flow() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;

    let record = core
        .arming
        .enable(PROJECT_ID, &version, false)
        .await
        .unwrap()
        .unwrap();

    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.schedule, record.schedule);
    assert!(!core.lock.is_held("flow-poll"));

    core.arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap();
    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert!(flow.schedule.is_none());
}

#[tokio::test]
async fn test_disable_with_failing_hook_still_clears_recorded_schedule() {
    let core = TestCore::new();
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();
    core.hooks.fail_disable();

    core.arming
        .disable(PROJECT_ID, &version, false, false)
        .await
        .unwrap_err();

    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert!(flow.schedule.is_none());
}

#[tokio::test]
async fn test_re_enable_resets_failure_count() {
    let core = TestCore::with_options(TestCoreOptions {
        failure_threshold: 3,
        ..Default::default()
    });
    let version_id = armed_polling_flow(&core, 2).await;
    let version = core.flows.get_version(&version_id).await.unwrap().unwrap();

    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();

    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.schedule.unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_renewal_schedule_is_not_recorded_on_flow() {
    let core = TestCore::new();
    let version = core
        .seed_flow(
            "flow-hook",
            TriggerStrategy::Webhook {
                renewal: Some(WebhookRenewal::Cron {
                    cron_expression: "0 0 * * *".to_string(),
                }),
            },
        )
        .await;

    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();

    let flow = core.flows.get_flow("flow-hook").await.unwrap().unwrap();
    assert!(flow.schedule.is_none());
}

#[tokio::test]
async fn test_failures_after_plain_enable_reach_threshold() {
    let core = TestCore::with_options(TestCoreOptions {
        failure_threshold: 2,
        ..Default::default()
    });
    let version = core.seed_flow("flow-poll", TriggerStrategy::Polling).await;
    core.arming.enable(PROJECT_ID, &version, false).await.unwrap();

    assert!(!core.failures.record_failure("flow-poll").await.unwrap());
    assert!(core.failures.record_failure("flow-poll").await.unwrap());

    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.status, FlowStatus::Disabled);
    assert!(core.memory_queue.queue(QueueName::Scheduled).is_empty());
}

#[tokio::test]
async fn test_failure_at_threshold_disables_flow() {
    let core = TestCore::with_options(TestCoreOptions {
        failure_threshold: 3,
        ..Default::default()
    });
    let version_id = armed_polling_flow(&core, 2).await;

    let disabled = core.failures.record_failure("flow-poll").await.unwrap();

    assert!(disabled);
    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.status, FlowStatus::Disabled);
    assert!(flow.schedule.is_none());
    assert!(core.memory_queue.queue(QueueName::Scheduled).get(&version_id).is_none());
    assert!(
        core.hooks
            .calls()
            .contains(&(TriggerHookType::OnDisable, version_id, false))
    );
    assert!(!core.lock.is_held("flow-poll"));
}

#[tokio::test]
async fn test_failure_below_threshold_only_counts() {
    let core = TestCore::with_options(TestCoreOptions {
        failure_threshold: 3,
        ..Default::default()
    });
    let version_id = armed_polling_flow(&core, 0).await;

    assert!(!core.failures.record_failure("flow-poll").await.unwrap());
    assert!(!core.failures.record_failure("flow-poll").await.unwrap());

    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.status, FlowStatus::Enabled);
    assert_eq!(flow.schedule.unwrap().failure_count, 2);
    assert!(core.memory_queue.queue(QueueName::Scheduled).get(&version_id).is_some());
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let core = TestCore::with_options(TestCoreOptions {
        failure_threshold: 3,
        ..Default::default()
    });
    armed_polling_flow(&core, 2).await;

    core.failures.record_success("flow-poll").await.unwrap();
    let flow = core.flows.get_flow("flow-poll").await.unwrap().unwrap();
    assert_eq!(flow.schedule.unwrap().failure_count, 0);

    // The reset means one more failure no longer reaches the threshold.
    assert!(!core.failures.record_failure("flow-poll").await.unwrap());
}
