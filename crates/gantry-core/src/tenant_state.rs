// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant rate-limit and usage counters, and the subscription tiers that
//! parameterize their defaults.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Subscription tier. Drives the default limits looked up by the policy
/// engine; a tenant may also carry a wholesale custom override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Default tier for unauthenticated or trial tenants.
    Free,
    /// Entry paid tier.
    Starter,
    /// Mid paid tier.
    Pro,
    /// Top paid tier.
    Enterprise,
}

/// A single rolling window counter: `{count, reset_at}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WindowCounter {
    /// Requests counted in the current window.
    pub count: u32,
    /// Instant at which the window resets to zero.
    #[schemars(with = "String")]
    pub reset_at: DateTime<Utc>,
}

impl WindowCounter {
    /// Construct a counter starting at zero with `reset_at = now + window`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
        }
    }

    /// If `now >= reset_at`, reset the counter to zero and advance `reset_at`
    /// by one full window. Idempotent when called repeatedly with the same
    /// `now` after the first reset.
    pub fn roll_forward(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + window;
        }
    }
}

/// The three rolling rate-limit windows tracked per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitState {
    /// 60-second window.
    pub minute: WindowCounter,
    /// 3600-second window.
    pub hour: WindowCounter,
    /// 86400-second window.
    pub day: WindowCounter,
}

impl RateLimitState {
    /// Initialize all three windows anchored at `now`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            minute: WindowCounter::starting_at(now, chrono::Duration::seconds(60)),
            hour: WindowCounter::starting_at(now, chrono::Duration::seconds(3_600)),
            day: WindowCounter::starting_at(now, chrono::Duration::seconds(86_400)),
        }
    }

    /// Roll all three windows forward relative to `now`.
    pub fn roll_forward(&mut self, now: DateTime<Utc>) {
        self.minute.roll_forward(now, chrono::Duration::seconds(60));
        self.hour.roll_forward(now, chrono::Duration::seconds(3_600));
        self.day.roll_forward(now, chrono::Duration::seconds(86_400));
    }
}

/// Per-tenant cost and concurrency usage, independent of the rate windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UsageState {
    /// Cost accrued in the current 24h rolling day window.
    pub day_cost_usd: f64,
    /// When the day window resets.
    #[schemars(with = "String")]
    pub day_reset_at: DateTime<Utc>,
    /// Cost accrued in the current calendar month.
    pub month_cost_usd: f64,
    /// When the month window resets.
    #[schemars(with = "String")]
    pub month_reset_at: DateTime<Utc>,
    /// Jobs currently running for this tenant.
    pub concurrent_jobs: u32,
}

impl UsageState {
    /// Initialize a zeroed usage state anchored at `now`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            day_cost_usd: 0.0,
            day_reset_at: now + chrono::Duration::seconds(86_400),
            month_cost_usd: 0.0,
            month_reset_at: next_calendar_month(now),
            concurrent_jobs: 0,
        }
    }
}

fn next_calendar_month(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Datelike;
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    now.with_day(1)
        .and_then(|d| d.with_year(year))
        .and_then(|d| d.with_month(month))
        .unwrap_or(now + chrono::Duration::days(30))
}
