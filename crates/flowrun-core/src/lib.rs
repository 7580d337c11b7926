// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowrun Core - Workflow Execution Core
//!
//! This crate decides when a workflow run executes, how its job is queued
//! and retried, how triggers are armed and disarmed, and how a synchronous
//! HTTP caller receives a response produced by a worker on another process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Execution workers (external)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//!            │ poll / update-job / update-run / remove-stale-job
//!            ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           WorkerApi                                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                 │
//! │  │   FlowRun    │  │   Trigger    │  │   Webhook    │                 │
//! │  │  Lifecycle   │  │   Arming     │  │   Response   │                 │
//! │  └──────────────┘  └──────────────┘  │   Watcher    │                 │
//! │          │                 │         └──────────────┘                 │
//! │          ▼                 ▼                 │                        │
//! │  ┌────────────────────────────────┐          │ pub/sub                │
//! │  │          QueueManager          │          │                        │
//! │  │   memory  |  redis             │          │                        │
//! │  └────────────────────────────────┘          │                        │
//! └──────────────────────────────────────────────────────────────────────┘
//!                     │                           │
//!                     ▼                           ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Redis (optional)                              │
//! │          (jobs, repeat specs, side index, locks, channels)            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`schedule`] | Cron + timezone to next fire instant |
//! | [`job`] | Job payloads, priorities, queue names |
//! | [`queue`] | Queue contract with memory and Redis backends |
//! | [`flow_run`] | Run state machine and its side effects |
//! | [`trigger`] | Trigger arming, disarming and failure tracking |
//! | [`app_event`] | Fan-out of app-level webhook events |
//! | [`webhook_response`] | Cross-process synchronous response routing |
//! | [`worker_api`] | Operations exposed to execution workers |
//! | [`sweeper`] | Background removal of stale jobs and runs |
//! | [`runtime`] | Embeddable runtime and its builder |
//!
//! # Queue Backends
//!
//! | Backend | Selected by | Deployment |
//! |---------|-------------|------------|
//! | Memory | `FLOWRUN_QUEUE_MODE=memory` (default) | single server instance |
//! | Redis | `FLOWRUN_QUEUE_MODE=redis` | any number of instances |
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables read at startup.

pub mod app_event;
pub mod config;
pub mod error;
pub mod exception;
pub mod flow_run;
pub mod job;
pub mod lock;
pub mod model;
pub mod pubsub;
pub mod queue;
pub mod rate_limiter;
pub mod runtime;
pub mod schedule;
pub mod store;
pub mod sweeper;
pub mod trigger;
pub mod webhook_response;
pub mod worker_api;

pub use error::{Error, Result};
pub use runtime::FlowRunRuntime;
