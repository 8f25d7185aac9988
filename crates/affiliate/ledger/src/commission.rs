use crate::config::CommissionConfig;
use crate::LedgerError;
use affiliate_types::{Affiliate, Commission, CommissionRate, CommissionStatus, Purchase};
use chrono::{DateTime, Duration, Utc};

/// Computes the commission for a converting purchase.
///
/// Pure apart from the clearing date, which is `now + hold`.
#[derive(Debug, Clone)]
pub struct CommissionCalculator {
    fallback_rate: CommissionRate,
    hold: Duration,
}

impl CommissionCalculator {
    pub fn new(fallback_rate: CommissionRate, hold: Duration) -> Self {
        Self {
            fallback_rate,
            hold,
        }
    }

    pub fn from_config(config: &CommissionConfig) -> Self {
        Self::new(config.default_rate, config.hold_period())
    }

    /// The affiliate's rate for the purchase category, or the fallback rate
    /// when the category is unmapped.
    pub fn rate_for(&self, affiliate: &Affiliate, purchase: &Purchase) -> CommissionRate {
        affiliate
            .commission_rates
            .rate_for(purchase.category)
            .unwrap_or(self.fallback_rate)
    }

    pub fn calculate(
        &self,
        affiliate: &Affiliate,
        purchase: &Purchase,
        now: DateTime<Utc>,
    ) -> Result<Commission, LedgerError> {
        let rate = self.rate_for(affiliate, purchase);
        let clears_at = now.checked_add_signed(self.hold).ok_or_else(|| {
            LedgerError::InvalidInput(format!(
                "hold period of {} days overflows the conversion time",
                self.hold.num_days()
            ))
        })?;
        Ok(Commission {
            rate,
            amount_minor: rate.commission_for(purchase.amount_minor),
            status: CommissionStatus::Pending,
            clears_at,
            cleared_at: None,
            paid_at: None,
            payout_id: None,
        })
    }
}
