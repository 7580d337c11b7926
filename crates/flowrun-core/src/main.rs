// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowrun Core - Workflow Execution Core
//!
//! Runs the queue backend, the webhook response watcher and the stale-job
//! sweeper until interrupted.

use tracing::{info, warn};

use flowrun_core::config::Config;
use flowrun_core::runtime::FlowRunRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrun_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        queue_mode = ?config.queue_mode,
        edition = ?config.edition,
        polling_interval_minutes = config.polling_interval_minutes,
        "Starting Flowrun Core"
    );

    let runtime = FlowRunRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!(
        server_id = %runtime.watcher().server_id(),
        "Flowrun Core ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Flowrun Core shut down");

    Ok(())
}
