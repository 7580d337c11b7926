// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron schedule calculation.
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and optional 6-field expressions with a
//! leading seconds field. Occurrences are computed in the schedule's IANA
//! timezone and returned in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::error::{Error, Result};

/// Timezone used when a schedule does not name one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Build the cron expression for a fixed poll interval in minutes.
pub fn polling_cron(interval_minutes: u32) -> String {
    format!("*/{} * * * *", interval_minutes)
}

/// Parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct ScheduleCalculator {
    expression: String,
    cron: Cron,
    timezone: Tz,
}

impl ScheduleCalculator {
    /// Parse a cron expression and timezone.
    pub fn new(cron_expression: &str, timezone: &str) -> Result<Self> {
        let cron = Cron::new(cron_expression)
            .with_seconds_optional()
            .parse()
            .map_err(|e| Error::InvalidSchedule {
                expression: cron_expression.to_string(),
                reason: e.to_string(),
            })?;

        let timezone: Tz = timezone.parse().map_err(|_| Error::InvalidSchedule {
            expression: timezone.to_string(),
            reason: "unknown timezone".to_string(),
        })?;

        Ok(Self {
            expression: cron_expression.to_string(),
            cron,
            timezone,
        })
    }

    /// The cron expression this calculator was built from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence at or after `start`.
    ///
    /// Used when a recurring job is inserted: it fires immediately only if
    /// `start` itself is an occurrence.
    pub fn first_fire_at(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.find(start, true)
    }

    /// First occurrence strictly after `previous`.
    ///
    /// Used when a recurring job is dequeued; the result is always later
    /// than the fire time that was just consumed.
    pub fn next_fire_after(&self, previous: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.find(previous, false)
    }

    fn find(&self, start: DateTime<Utc>, inclusive: bool) -> Result<DateTime<Utc>> {
        let local = start.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, inclusive)
            .map(|next| next.with_timezone(&Utc))
            .map_err(|e| Error::InvalidSchedule {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }
}

/// Compute the next fire instant for a cron expression in a timezone.
pub fn next_fire_at(
    cron_expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    ScheduleCalculator::new(cron_expression, timezone)?.next_fire_after(after)
}

/// Validate a cron expression and timezone without computing anything.
pub fn validate(cron_expression: &str, timezone: &str) -> Result<()> {
    ScheduleCalculator::new(cron_expression, timezone).map(|_| ())
}
