use crate::balance::BalanceLedger;
use crate::locks::AffiliateLocks;
use crate::LedgerError;
use affiliate_storage::{AffiliateStorage, PayoutCommit, QueryWindow};
use affiliate_types::{
    AffiliateId, CommissionStatus, Payout, PayoutBreakdown, PayoutId, PayoutPeriod, PayoutStatus,
    ReferralStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Batches an affiliate's cleared commissions into a payout.
pub struct PayoutBatcher {
    storage: Arc<dyn AffiliateStorage>,
    locks: Arc<AffiliateLocks>,
    lock_timeout: Duration,
}

impl PayoutBatcher {
    pub fn new(
        storage: Arc<dyn AffiliateStorage>,
        locks: Arc<AffiliateLocks>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            locks,
            lock_timeout,
        }
    }

    /// Create a payout for everything cleared and unpaid.
    ///
    /// The balance and the cleared referrals are read under the affiliate's
    /// writer lock, so a commission clearing concurrently lands either wholly
    /// in this payout or wholly in the next one.
    pub async fn create_payout(
        &self,
        affiliate_id: &AffiliateId,
        processed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, LedgerError> {
        let _guard = self.locks.lock_within(affiliate_id, self.lock_timeout).await?;

        let affiliate = self
            .storage
            .get_affiliate(affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::AffiliateNotFound(affiliate_id.clone()))?;

        let available_minor = affiliate.balance.available_minor;
        let minimum_minor = affiliate.payout.minimum_payout_minor;
        if available_minor < minimum_minor {
            return Err(LedgerError::BelowMinimum {
                available_minor,
                minimum_minor,
            });
        }
        let method = affiliate
            .payout
            .method
            .ok_or_else(|| LedgerError::NoPayoutMethod(affiliate_id.clone()))?;

        let settled: Vec<_> = self
            .storage
            .list_referrals_for_affiliate(affiliate_id, Some(CommissionStatus::Cleared))
            .await?
            .into_iter()
            .filter(|referral| referral.status == ReferralStatus::Converted)
            .collect();
        let period = PayoutPeriod::spanning(
            settled
                .iter()
                .map(|referral| referral.converted_at.unwrap_or(referral.clicked_at)),
        )
        .ok_or_else(|| LedgerError::NoClearedCommissions(affiliate_id.clone()))?;

        let gross_minor = settled
            .iter()
            .fold(0u64, |sum, referral| {
                sum.saturating_add(referral.commission_amount_minor())
            });
        let adjustments_minor = i64::try_from(i128::from(available_minor) - i128::from(gross_minor))
            .unwrap_or(i64::MAX);
        if adjustments_minor != 0 {
            tracing::warn!(
                affiliate_id = %affiliate_id,
                available_minor,
                gross_minor,
                "Available balance differs from cleared commissions"
            );
        }

        let payout = Payout {
            payout_id: PayoutId::generate(),
            affiliate_id: affiliate_id.clone(),
            amount_minor: available_minor,
            method,
            destination: affiliate.payout.destination.clone(),
            status: PayoutStatus::Pending,
            period,
            breakdown: PayoutBreakdown {
                gross_minor,
                fees_minor: 0,
                adjustments_minor,
                referral_count: u32::try_from(settled.len()).unwrap_or(u32::MAX),
            },
            referral_ids: settled
                .iter()
                .map(|referral| referral.referral_id.clone())
                .collect(),
            processed_by: processed_by.to_string(),
            created_at: now,
        };

        let committed = self
            .storage
            .commit_payout(PayoutCommit {
                movement: BalanceLedger::disbursement(payout.amount_minor),
                payout,
            })
            .await?;
        BalanceLedger::observe(affiliate_id, "payout", &committed.balance);

        tracing::info!(
            affiliate_id = %affiliate_id,
            payout_id = %committed.payout.payout_id,
            amount_minor = committed.payout.amount_minor,
            referral_count = committed.payout.breakdown.referral_count,
            processed_by = %processed_by,
            "Payout created"
        );
        Ok(committed.payout)
    }

    pub async fn get_payout(&self, payout_id: &PayoutId) -> Result<Option<Payout>, LedgerError> {
        Ok(self.storage.get_payout(payout_id).await?)
    }

    pub async fn list_payouts(
        &self,
        affiliate_id: &AffiliateId,
        window: QueryWindow,
    ) -> Result<Vec<Payout>, LedgerError> {
        Ok(self
            .storage
            .list_payouts_for_affiliate(affiliate_id, window)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::CommissionCalculator;
    use crate::config::{LedgerConfig, SweepConfig};
    use crate::referrals::{ConversionTarget, ReferralStateMachine};
    use crate::registry::{AffiliateRegistry, EnrollAffiliate};
    use crate::sweep::ClearingSweep;
    use crate::tracker::{AttributionTracker, ClickOutcome};
    use affiliate_storage::memory::InMemoryAffiliateStorage;
    use affiliate_storage::ReferralStore;
    use affiliate_types::{PayoutMethod, PayoutPolicy, Purchase, PurchaseCategory, TrackingContext};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        storage: Arc<InMemoryAffiliateStorage>,
        registry: AffiliateRegistry,
        tracker: AttributionTracker,
        machine: ReferralStateMachine,
        sweep: ClearingSweep,
        batcher: PayoutBatcher,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryAffiliateStorage::new());
        let config = Arc::new(LedgerConfig::default());
        let locks = Arc::new(AffiliateLocks::new());
        Fixture {
            registry: AffiliateRegistry::new(storage.clone(), config.clone()),
            tracker: AttributionTracker::new(storage.clone()),
            machine: ReferralStateMachine::new(
                storage.clone(),
                CommissionCalculator::from_config(&config.commission),
                locks.clone(),
                config.sweep.lock_timeout(),
            ),
            sweep: ClearingSweep::new(storage.clone(), locks.clone(), SweepConfig::default()),
            batcher: PayoutBatcher::new(storage.clone(), locks, config.sweep.lock_timeout()),
            storage,
        }
    }

    impl Fixture {
        async fn enroll(&self, method: Option<PayoutMethod>, minimum: u64) -> AffiliateId {
            self.registry
                .enroll(
                    EnrollAffiliate {
                        code: "maria".to_string(),
                        display_name: "Maria".to_string(),
                        payout: Some(PayoutPolicy {
                            method,
                            destination: Some("maria@example.com".to_string()),
                            minimum_payout_minor: minimum,
                        }),
                        ..EnrollAffiliate::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap()
                .affiliate_id
        }

        async fn convert(&self, reference: &str, amount_minor: u64, at: DateTime<Utc>) {
            let ClickOutcome::Attributed { referral_id, .. } = self
                .tracker
                .track_click("maria", TrackingContext::default(), at)
                .await
                .unwrap()
            else {
                panic!("click was not attributed");
            };
            self.machine
                .track_conversion(
                    &ConversionTarget::Referral { referral_id },
                    Purchase {
                        category: PurchaseCategory::Courses,
                        reference_id: reference.to_string(),
                        amount_minor,
                    },
                    at,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn operator_errors_are_reported_in_order() {
        let fx = fixture();
        let affiliate_id = fx.enroll(None, 0).await;

        let result = fx.batcher.create_payout(&affiliate_id, "ops", Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::NoPayoutMethod(_))));

        fx.registry
            .set_payout_policy(
                &affiliate_id,
                PayoutPolicy {
                    method: Some(PayoutMethod::Stripe),
                    destination: None,
                    minimum_payout_minor: 0,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let result = fx.batcher.create_payout(&affiliate_id, "ops", Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::NoClearedCommissions(_))));

        let missing = fx
            .batcher
            .create_payout(&AffiliateId::new("missing"), "ops", Utc::now())
            .await;
        assert!(matches!(missing, Err(LedgerError::AffiliateNotFound(_))));
    }

    #[tokio::test]
    async fn payout_settles_cleared_and_leaves_pending() {
        let fx = fixture();
        let affiliate_id = fx.enroll(Some(PayoutMethod::Paypal), 1_000).await;
        let t0 = Utc::now();
        fx.convert("pi_1", 10_000, t0).await;
        fx.convert("pi_2", 5_000, t0 + ChronoDuration::days(3)).await;
        fx.convert("pi_3", 7_000, t0 + ChronoDuration::days(20)).await;

        let sweep_at = t0 + ChronoDuration::days(34);
        fx.sweep.run(sweep_at).await.unwrap();

        let payout = fx
            .batcher
            .create_payout(&affiliate_id, "finance@example.com", sweep_at)
            .await
            .unwrap();
        assert_eq!(payout.amount_minor, 3_000);
        assert_eq!(payout.breakdown.gross_minor, 3_000);
        assert_eq!(payout.breakdown.adjustments_minor, 0);
        assert_eq!(payout.breakdown.referral_count, 2);
        assert_eq!(payout.period.start, t0);
        assert_eq!(payout.period.end, t0 + ChronoDuration::days(3));
        assert_eq!(payout.method, PayoutMethod::Paypal);
        assert_eq!(payout.status, PayoutStatus::Pending);
        assert_eq!(payout.processed_by, "finance@example.com");

        for referral_id in &payout.referral_ids {
            let referral = fx.storage.get_referral(referral_id).await.unwrap().unwrap();
            assert_eq!(referral.status, ReferralStatus::Paid);
            let commission = referral.commission.unwrap();
            assert_eq!(commission.status, CommissionStatus::Paid);
            assert_eq!(commission.payout_id.as_ref(), Some(&payout.payout_id));
            assert_eq!(commission.paid_at, Some(sweep_at));
        }

        let balance = fx.registry.get(&affiliate_id).await.unwrap().balance;
        assert_eq!(balance.available_minor, 0);
        assert_eq!(balance.pending_minor, 1_400);
        assert_eq!(balance.lifetime_minor, 4_400);

        let listed = fx
            .batcher
            .list_payouts(&affiliate_id, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        let fetched = fx.batcher.get_payout(&payout.payout_id).await.unwrap();
        assert_eq!(fetched.map(|p| p.amount_minor), Some(3_000));
    }
}
