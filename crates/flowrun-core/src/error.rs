// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowrun-core.
//!
//! Not-found, conflict and validation errors propagate to the worker-facing
//! boundary unmodified. Throttling is never an error: enqueue reports a
//! boolean instead.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Engine token could not be issued or verified.
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Flow was not found.
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow version was not found.
    #[error("Flow version not found: {0}")]
    FlowVersionNotFound(String),

    /// Flow run was not found.
    #[error("Flow run not found: {0}")]
    FlowRunNotFound(String),

    /// The resource was mutated concurrently, is locked, or is in a state
    /// that does not allow the requested transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Cron expression or timezone could not be parsed.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        /// The offending cron expression or timezone.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// A trigger hook (`ON_ENABLE` / `ON_DISABLE`) failed.
    #[error("Trigger hook failed: {0}")]
    Hook(String),

    /// Caller presented a missing or mismatched engine token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code for the worker-facing boundary.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Redis(_) => "QUEUE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Token(_) | Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::FlowNotFound(_) => "FLOW_NOT_FOUND",
            Self::FlowVersionNotFound(_) => "FLOW_VERSION_NOT_FOUND",
            Self::FlowRunNotFound(_) => "FLOW_RUN_NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            Self::Hook(_) => "TRIGGER_HOOK_FAILED",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error refers to an absent flow, version or run.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FlowNotFound(_) | Self::FlowVersionNotFound(_) | Self::FlowRunNotFound(_)
        )
    }
}

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;
