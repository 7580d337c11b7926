// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band exception collection.
//!
//! Used for problems that must be observable but must not fail the
//! caller's request, such as a repeating job whose index entry is gone.

use tracing::error;

/// Sink for non-fatal, reportable errors.
pub trait ExceptionReporter: Send + Sync {
    /// Report a problem in `context`.
    fn report(&self, context: &str, message: &str);
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionReporter;

impl ExceptionReporter for TracingExceptionReporter {
    fn report(&self, context: &str, message: &str) {
        error!(target: "exception", context = context, "{}", message);
    }
}
