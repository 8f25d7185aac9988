//! Balance ledger.
//!
//! Each commission event maps to one [`BalanceMovement`], applied by the store
//! as an increment. This module builds those movements, reports clamps and
//! reconciles a balance against the referral and payout records.

use crate::LedgerError;
use affiliate_storage::{AffiliateStorage, QueryWindow};
use affiliate_types::{AffiliateId, Balance, BalanceApplied, BalanceMovement, CommissionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Balance reconciliation for one affiliate.
///
/// `lifetime_gap_minor` is `lifetime - (pending + available + paid out)` and
/// is zero for a consistent ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub affiliate_id: AffiliateId,
    pub balance: Balance,
    pub pending_commissions_minor: u64,
    pub cleared_commissions_minor: u64,
    pub paid_commissions_minor: u64,
    pub paid_out_minor: u64,
    pub payout_count: usize,
    pub lifetime_gap_minor: i128,
    /// Stored pending balance minus the sum of pending commissions.
    pub pending_drift_minor: i128,
    /// Stored available balance minus the sum of cleared, unpaid commissions.
    pub available_drift_minor: i128,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.lifetime_gap_minor == 0
            && self.pending_drift_minor == 0
            && self.available_drift_minor == 0
    }
}

/// Movement builders and reconciliation over the stored balances.
pub struct BalanceLedger {
    storage: Arc<dyn AffiliateStorage>,
}

impl BalanceLedger {
    pub fn new(storage: Arc<dyn AffiliateStorage>) -> Self {
        Self { storage }
    }

    /// Conversion: `pending += amount`, `lifetime += amount`.
    pub fn accrual(amount_minor: u64) -> BalanceMovement {
        BalanceMovement::Accrue { amount_minor }
    }

    /// Clearing: `pending -= amount`, `available += amount`.
    pub fn clearing(amount_minor: u64) -> BalanceMovement {
        BalanceMovement::Clear { amount_minor }
    }

    /// Payout: `available -= amount`.
    pub fn disbursement(amount_minor: u64) -> BalanceMovement {
        BalanceMovement::Disburse { amount_minor }
    }

    /// Log the result of an applied movement; clamps are never silent.
    pub fn observe(affiliate_id: &AffiliateId, event: &str, applied: &BalanceApplied) {
        if applied.was_clamped() {
            tracing::warn!(
                affiliate_id = %affiliate_id,
                event = event,
                clamped_minor = applied.clamped_minor,
                pending_minor = applied.balance.pending_minor,
                available_minor = applied.balance.available_minor,
                "Balance decrement clamped at zero"
            );
        } else {
            tracing::debug!(
                affiliate_id = %affiliate_id,
                event = event,
                pending_minor = applied.balance.pending_minor,
                available_minor = applied.balance.available_minor,
                lifetime_minor = applied.balance.lifetime_minor,
                "Balance updated"
            );
        }
    }

    pub async fn balance(&self, affiliate_id: &AffiliateId) -> Result<Balance, LedgerError> {
        self.storage
            .get_affiliate(affiliate_id)
            .await?
            .map(|affiliate| affiliate.balance)
            .ok_or_else(|| LedgerError::AffiliateNotFound(affiliate_id.clone()))
    }

    pub async fn reconcile(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<ReconciliationReport, LedgerError> {
        let balance = self.balance(affiliate_id).await?;
        let referrals = self
            .storage
            .list_referrals_for_affiliate(affiliate_id, None)
            .await?;
        let payouts = self
            .storage
            .list_payouts_for_affiliate(affiliate_id, QueryWindow::default())
            .await?;

        let mut pending = 0u64;
        let mut cleared = 0u64;
        let mut paid = 0u64;
        for commission in referrals.iter().filter_map(|r| r.commission.as_ref()) {
            let bucket = match commission.status {
                CommissionStatus::Pending => &mut pending,
                CommissionStatus::Cleared => &mut cleared,
                CommissionStatus::Paid => &mut paid,
            };
            *bucket = bucket.saturating_add(commission.amount_minor);
        }
        let paid_out: u64 = payouts
            .iter()
            .fold(0u64, |sum, payout| sum.saturating_add(payout.amount_minor));

        let report = ReconciliationReport {
            affiliate_id: affiliate_id.clone(),
            balance,
            pending_commissions_minor: pending,
            cleared_commissions_minor: cleared,
            paid_commissions_minor: paid,
            paid_out_minor: paid_out,
            payout_count: payouts.len(),
            lifetime_gap_minor: i128::from(balance.lifetime_minor)
                - i128::from(balance.pending_minor)
                - i128::from(balance.available_minor)
                - i128::from(paid_out),
            pending_drift_minor: i128::from(balance.pending_minor) - i128::from(pending),
            available_drift_minor: i128::from(balance.available_minor) - i128::from(cleared),
        };

        if !report.is_consistent() {
            tracing::warn!(
                affiliate_id = %affiliate_id,
                lifetime_gap_minor = %report.lifetime_gap_minor,
                pending_drift_minor = %report.pending_drift_minor,
                available_drift_minor = %report.available_drift_minor,
                "Balance reconciliation found drift"
            );
        }
        Ok(report)
    }
}
