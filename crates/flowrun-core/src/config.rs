// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for flowrun-core.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which queue backend the process runs with.
///
/// Selected once at startup; the memory backend is only valid for
/// single-instance deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// In-process queue (single server instance only).
    Memory,
    /// Redis-backed distributed queue.
    Redis,
}

impl FromStr for QueueMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(ConfigError::InvalidValue {
                var: "FLOWRUN_QUEUE_MODE",
                value: s.to_string(),
            }),
        }
    }
}

/// Deployment edition of the hosting installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Edition {
    /// Self-hosted community edition.
    Community,
    /// Self-hosted enterprise edition.
    Enterprise,
    /// Hosted cloud edition.
    Cloud,
}

impl FromStr for Edition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "community" | "ce" => Ok(Self::Community),
            "enterprise" | "ee" => Ok(Self::Enterprise),
            "cloud" => Ok(Self::Cloud),
            _ => Err(ConfigError::InvalidValue {
                var: "FLOWRUN_EDITION",
                value: s.to_string(),
            }),
        }
    }
}

/// Core configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Queue backend selection
    pub queue_mode: QueueMode,
    /// Redis URL (required for `QueueMode::Redis`)
    pub redis_url: Option<String>,
    /// Namespace prefix for every Redis key this process writes
    pub redis_key_prefix: String,
    /// Edition of this deployment
    pub edition: Edition,
    /// Default poll interval (minutes, 1-59) for polling triggers without their own schedule
    pub polling_interval_minutes: u32,
    /// How long a synchronous webhook caller waits before a no-content response
    pub webhook_timeout: Duration,
    /// Consecutive trigger failures before a flow is auto-disabled
    pub trigger_failure_threshold: u32,
    /// HMAC secret for engine tokens
    pub engine_token_secret: String,
    /// Lifetime of issued engine tokens
    pub engine_token_ttl: Duration,
    /// Age after which one-time jobs and scheduled runs count as stale
    pub stale_job_max_age: Duration,
    /// How often the stale-job sweeper runs
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_mode = lookup("FLOWRUN_QUEUE_MODE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(QueueMode::Memory);

        let redis_url = lookup("FLOWRUN_REDIS_URL");
        if queue_mode == QueueMode::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("FLOWRUN_REDIS_URL"));
        }

        let redis_key_prefix =
            lookup("FLOWRUN_REDIS_KEY_PREFIX").unwrap_or_else(|| "flowrun".to_string());

        let edition = lookup("FLOWRUN_EDITION")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Edition::Community);

        let polling_interval_minutes: u32 =
            parse_or(&lookup, "FLOWRUN_POLLING_INTERVAL_MINUTES", 5)?;
        // Becomes the step of a `*/N` minute field.
        if !(1..=59).contains(&polling_interval_minutes) {
            return Err(ConfigError::InvalidValue {
                var: "FLOWRUN_POLLING_INTERVAL_MINUTES",
                value: polling_interval_minutes.to_string(),
            });
        }

        let webhook_timeout_secs: u64 = parse_or(&lookup, "FLOWRUN_WEBHOOK_TIMEOUT_SECONDS", 30)?;
        let trigger_failure_threshold: u32 =
            parse_or(&lookup, "FLOWRUN_TRIGGER_FAILURE_THRESHOLD", 576)?;

        let engine_token_secret = lookup("FLOWRUN_ENGINE_TOKEN_SECRET")
            .ok_or(ConfigError::MissingEnvVar("FLOWRUN_ENGINE_TOKEN_SECRET"))?;
        let engine_token_ttl_secs: u64 =
            parse_or(&lookup, "FLOWRUN_ENGINE_TOKEN_TTL_SECONDS", 3600)?;

        let stale_job_max_age_secs: u64 =
            parse_or(&lookup, "FLOWRUN_STALE_JOB_MAX_AGE_SECONDS", 24 * 3600)?;
        let sweep_interval_secs: u64 = parse_or(&lookup, "FLOWRUN_SWEEP_INTERVAL_SECONDS", 3600)?;

        Ok(Self {
            queue_mode,
            redis_url,
            redis_key_prefix,
            edition,
            polling_interval_minutes,
            webhook_timeout: Duration::from_secs(webhook_timeout_secs),
            trigger_failure_threshold,
            engine_token_secret,
            engine_token_ttl: Duration::from_secs(engine_token_ttl_secs),
            stale_job_max_age: Duration::from_secs(stale_job_max_age_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}
