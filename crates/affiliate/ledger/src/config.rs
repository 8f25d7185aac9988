//! Ledger configuration.
//!
//! Defaults match the production policy: 20% commission, a 30 day clearing
//! hold and a 30 day attribution cookie.

use affiliate_types::{CommissionRate, DEFAULT_COMMISSION_RATE, DEFAULT_COOKIE_DAYS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the affiliate ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Commission calculation and clearing.
    pub commission: CommissionConfig,

    /// Attribution defaults for new affiliates.
    pub attribution: AttributionConfig,

    /// Clearing sweep behaviour.
    pub sweep: SweepConfig,
}

impl LedgerConfig {
    /// Short windows and small pages for local runs and tests.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.commission.hold_days = 1;
        config.attribution.cookie_days = 7;
        config.sweep.page_size = 50;
        config.sweep.interval_secs = 60;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    /// Rate applied when the affiliate's table has no entry for a category.
    pub default_rate: CommissionRate,

    /// Days a commission stays pending before it may clear.
    pub hold_days: u32,

    /// Minimum payout assigned at enrollment when none is given.
    pub default_minimum_payout_minor: u64,
}

impl CommissionConfig {
    pub fn hold_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.hold_days))
    }
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            default_rate: DEFAULT_COMMISSION_RATE,
            hold_days: 30,
            default_minimum_payout_minor: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Cookie lifetime assigned at enrollment when none is given.
    pub cookie_days: u32,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            cookie_days: DEFAULT_COOKIE_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Referrals fetched per page.
    pub page_size: usize,

    /// Seconds between scheduled sweeps.
    pub interval_secs: u64,

    /// Upper bound on waiting for an affiliate's writer lock.
    pub lock_timeout_ms: u64,
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            interval_secs: 3_600,
            lock_timeout_ms: 5_000,
        }
    }
}
