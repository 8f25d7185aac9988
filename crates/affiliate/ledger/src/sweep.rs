//! Clearing sweep.
//!
//! Matures pending commissions whose clearing date has passed. Referrals are
//! scanned in keyset pages ordered by id; each one is cleared by a single
//! guarded store commit under its affiliate's writer lock, so a re-run or a
//! concurrent process finds nothing left to do for it.

use crate::balance::BalanceLedger;
use crate::config::SweepConfig;
use crate::locks::AffiliateLocks;
use crate::LedgerError;
use affiliate_storage::{AffiliateStorage, ClearingCommit, PageRequest, StorageError};
use affiliate_types::{Referral, ReferralId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Summary of one sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub as_of: Option<DateTime<Utc>>,
    pub pages: u32,
    pub scanned: u64,
    pub cleared: u64,
    /// Already cleared elsewhere between the scan and the commit.
    pub skipped: u64,
    pub failed: Vec<ReferralId>,
    pub cleared_minor: u64,
    pub clamped_minor: u64,
    pub cancelled: bool,
}

enum ItemResult {
    Cleared { amount_minor: u64, clamped_minor: u64 },
    Skipped,
}

/// Batch job moving due commissions from pending to available.
pub struct ClearingSweep {
    storage: Arc<dyn AffiliateStorage>,
    locks: Arc<AffiliateLocks>,
    config: SweepConfig,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClearingSweep {
    pub fn new(
        storage: Arc<dyn AffiliateStorage>,
        locks: Arc<AffiliateLocks>,
        config: SweepConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep to completion.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        self.run_until(now, None).await
    }

    /// Run one sweep, stopping between pages once `cancel` reads `true`.
    pub async fn run_until(
        &self,
        now: DateTime<Utc>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport, LedgerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LedgerError::SweepAlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let mut report = SweepReport {
            as_of: Some(now),
            ..SweepReport::default()
        };
        let mut page = PageRequest::first(self.config.page_size.max(1));

        loop {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                report.cancelled = true;
                tracing::info!(pages = report.pages, "Clearing sweep cancelled");
                break;
            }

            let due = self.storage.list_due_commissions(now, page.clone()).await?;
            let Some(last) = due.last().map(|referral| referral.referral_id.clone()) else {
                break;
            };
            report.pages += 1;
            let full_page = due.len() >= page.limit;

            for referral in due {
                report.scanned += 1;
                match self.clear_one(&referral, now).await {
                    Ok(ItemResult::Cleared {
                        amount_minor,
                        clamped_minor,
                    }) => {
                        report.cleared += 1;
                        report.cleared_minor = report.cleared_minor.saturating_add(amount_minor);
                        report.clamped_minor = report.clamped_minor.saturating_add(clamped_minor);
                    }
                    Ok(ItemResult::Skipped) => report.skipped += 1,
                    Err(err) => {
                        tracing::error!(
                            referral_id = %referral.referral_id,
                            affiliate_id = %referral.affiliate_id,
                            error = %err,
                            "Failed to clear commission"
                        );
                        report.failed.push(referral.referral_id);
                    }
                }
            }

            if !full_page {
                break;
            }
            page = page.next_after(last);
        }

        tracing::info!(
            pages = report.pages,
            scanned = report.scanned,
            cleared = report.cleared,
            skipped = report.skipped,
            failed = report.failed.len(),
            cleared_minor = report.cleared_minor,
            "Clearing sweep finished"
        );
        Ok(report)
    }

    async fn clear_one(
        &self,
        referral: &Referral,
        now: DateTime<Utc>,
    ) -> Result<ItemResult, LedgerError> {
        let amount_minor = referral.commission_amount_minor();
        let _guard = self
            .locks
            .lock_within(&referral.affiliate_id, self.config.lock_timeout())
            .await?;

        let commit = ClearingCommit {
            referral_id: referral.referral_id.clone(),
            movement: BalanceLedger::clearing(amount_minor),
            cleared_at: now,
        };
        match self.storage.commit_clearing(commit).await {
            Ok(committed) => {
                BalanceLedger::observe(&referral.affiliate_id, "clearing", &committed.balance);
                tracing::info!(
                    affiliate_id = %referral.affiliate_id,
                    referral_id = %referral.referral_id,
                    amount_minor,
                    "Commission cleared"
                );
                Ok(ItemResult::Cleared {
                    amount_minor,
                    clamped_minor: committed.balance.clamped_minor,
                })
            }
            Err(StorageError::PreconditionFailed(reason)) => {
                tracing::warn!(
                    referral_id = %referral.referral_id,
                    reason = %reason,
                    "Commission no longer due, skipped"
                );
                Ok(ItemResult::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::CommissionCalculator;
    use crate::config::LedgerConfig;
    use crate::referrals::{ConversionTarget, ReferralStateMachine};
    use crate::registry::{AffiliateRegistry, EnrollAffiliate};
    use crate::tracker::{AttributionTracker, ClickOutcome};
    use affiliate_storage::memory::InMemoryAffiliateStorage;
    use affiliate_storage::{
        AffiliateStore, ClearingCommitted, ClickCommitted, ConversionCommit, ConversionCommitted,
        LedgerCommitStore, PayoutCommit, PayoutCommitted, PayoutStore, QueryWindow, ReferralStore,
        StorageResult,
    };
    use affiliate_types::{
        Affiliate, AffiliateId, AffiliateStatus, CommissionStatus, CustomLink, Payout, PayoutId,
        PayoutPolicy, Purchase, PurchaseCategory, TrackingContext, UserId,
    };
    use async_trait::async_trait;
    use chrono::Duration;

    /// In-memory storage that fails the clearing commit of chosen referrals.
    struct FlakyClearing {
        inner: InMemoryAffiliateStorage,
        fail: std::sync::Mutex<Vec<ReferralId>>,
    }

    #[async_trait]
    impl AffiliateStore for FlakyClearing {
        async fn create_affiliate(&self, affiliate: Affiliate) -> StorageResult<()> {
            self.inner.create_affiliate(affiliate).await
        }
        async fn get_affiliate(&self, id: &AffiliateId) -> StorageResult<Option<Affiliate>> {
            self.inner.get_affiliate(id).await
        }
        async fn find_affiliate_by_code(&self, code: &str) -> StorageResult<Option<Affiliate>> {
            self.inner.find_affiliate_by_code(code).await
        }
        async fn set_affiliate_status(
            &self,
            id: &AffiliateId,
            status: AffiliateStatus,
            at: DateTime<Utc>,
        ) -> StorageResult<()> {
            self.inner.set_affiliate_status(id, status, at).await
        }
        async fn set_payout_policy(
            &self,
            id: &AffiliateId,
            policy: PayoutPolicy,
            at: DateTime<Utc>,
        ) -> StorageResult<()> {
            self.inner.set_payout_policy(id, policy, at).await
        }
        async fn add_custom_link(&self, id: &AffiliateId, link: CustomLink) -> StorageResult<()> {
            self.inner.add_custom_link(id, link).await
        }
        async fn list_affiliates(&self, window: QueryWindow) -> StorageResult<Vec<Affiliate>> {
            self.inner.list_affiliates(window).await
        }
    }

    #[async_trait]
    impl ReferralStore for FlakyClearing {
        async fn get_referral(&self, id: &ReferralId) -> StorageResult<Option<Referral>> {
            self.inner.get_referral(id).await
        }
        async fn find_open_referral_for_user(
            &self,
            user_id: &UserId,
            affiliate_id: Option<&AffiliateId>,
            now: DateTime<Utc>,
        ) -> StorageResult<Option<Referral>> {
            self.inner
                .find_open_referral_for_user(user_id, affiliate_id, now)
                .await
        }
        async fn find_referral_by_payment_reference(
            &self,
            reference_id: &str,
        ) -> StorageResult<Option<Referral>> {
            self.inner
                .find_referral_by_payment_reference(reference_id)
                .await
        }
        async fn list_due_commissions(
            &self,
            now: DateTime<Utc>,
            page: PageRequest,
        ) -> StorageResult<Vec<Referral>> {
            self.inner.list_due_commissions(now, page).await
        }
        async fn list_referrals_for_affiliate(
            &self,
            id: &AffiliateId,
            status: Option<CommissionStatus>,
        ) -> StorageResult<Vec<Referral>> {
            self.inner.list_referrals_for_affiliate(id, status).await
        }
    }

    #[async_trait]
    impl PayoutStore for FlakyClearing {
        async fn get_payout(&self, id: &PayoutId) -> StorageResult<Option<Payout>> {
            self.inner.get_payout(id).await
        }
        async fn list_payouts_for_affiliate(
            &self,
            id: &AffiliateId,
            window: QueryWindow,
        ) -> StorageResult<Vec<Payout>> {
            self.inner.list_payouts_for_affiliate(id, window).await
        }
    }

    #[async_trait]
    impl LedgerCommitStore for FlakyClearing {
        async fn commit_click(&self, referral: Referral) -> StorageResult<ClickCommitted> {
            self.inner.commit_click(referral).await
        }
        async fn commit_signup(
            &self,
            id: &ReferralId,
            user_id: &UserId,
            at: DateTime<Utc>,
        ) -> StorageResult<Referral> {
            self.inner.commit_signup(id, user_id, at).await
        }
        async fn commit_conversion(
            &self,
            commit: ConversionCommit,
        ) -> StorageResult<ConversionCommitted> {
            self.inner.commit_conversion(commit).await
        }
        async fn commit_clearing(
            &self,
            commit: ClearingCommit,
        ) -> StorageResult<ClearingCommitted> {
            let failing = self
                .fail
                .lock()
                .map(|ids| ids.contains(&commit.referral_id))
                .unwrap_or(false);
            if failing {
                return Err(StorageError::Backend("injected failure".to_string()));
            }
            self.inner.commit_clearing(commit).await
        }
        async fn commit_payout(&self, commit: PayoutCommit) -> StorageResult<PayoutCommitted> {
            self.inner.commit_payout(commit).await
        }
    }

    struct Fixture {
        storage: Arc<FlakyClearing>,
        registry: AffiliateRegistry,
        tracker: AttributionTracker,
        machine: ReferralStateMachine,
        sweep: ClearingSweep,
    }

    fn fixture(page_size: usize) -> Fixture {
        let storage = Arc::new(FlakyClearing {
            inner: InMemoryAffiliateStorage::new(),
            fail: std::sync::Mutex::new(Vec::new()),
        });
        let config = Arc::new(LedgerConfig::default());
        let locks = Arc::new(AffiliateLocks::new());
        let sweep_config = SweepConfig {
            page_size,
            ..SweepConfig::default()
        };
        Fixture {
            registry: AffiliateRegistry::new(storage.clone(), config.clone()),
            tracker: AttributionTracker::new(storage.clone()),
            machine: ReferralStateMachine::new(
                storage.clone(),
                CommissionCalculator::from_config(&config.commission),
                locks.clone(),
                config.sweep.lock_timeout(),
            ),
            sweep: ClearingSweep::new(storage.clone(), locks, sweep_config),
            storage,
        }
    }

    impl Fixture {
        /// Enroll `code` and convert `count` purchases of 10000 at `at`.
        async fn converted(&self, code: &str, count: usize, at: DateTime<Utc>) -> AffiliateId {
            let affiliate = self
                .registry
                .enroll(
                    EnrollAffiliate {
                        code: code.to_string(),
                        display_name: code.to_string(),
                        ..EnrollAffiliate::default()
                    },
                    at,
                )
                .await
                .unwrap();
            for n in 0..count {
                let ClickOutcome::Attributed { referral_id, .. } = self
                    .tracker
                    .track_click(code, TrackingContext::default(), at)
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
                            reference_id: format!("{code}-{n}"),
                            amount_minor: 10_000,
                        },
                        at,
                    )
                    .await
                    .unwrap();
            }
            affiliate.affiliate_id
        }
    }

    #[tokio::test]
    async fn sweep_clears_only_due_commissions_across_pages() {
        let fx = fixture(2);
        let t0 = Utc::now();
        let early = fx.converted("early", 5, t0).await;
        let late = fx.converted("late", 1, t0 + Duration::days(10)).await;

        let report = fx.sweep.run(t0 + Duration::days(31)).await.unwrap();
        assert_eq!(report.cleared, 5);
        assert_eq!(report.cleared_minor, 10_000);
        assert!(report.pages >= 3);
        assert!(report.failed.is_empty());

        let early = fx.registry.get(&early).await.unwrap();
        assert_eq!(early.balance.pending_minor, 0);
        assert_eq!(early.balance.available_minor, 10_000);
        let late = fx.registry.get(&late).await.unwrap();
        assert_eq!(late.balance.pending_minor, 2_000);
        assert_eq!(late.balance.available_minor, 0);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let fx = fixture(10);
        let t0 = Utc::now();
        let affiliate_id = fx.converted("maria", 3, t0).await;
        let when = t0 + Duration::days(30);

        let first = fx.sweep.run(when).await.unwrap();
        let after_first = fx.registry.get(&affiliate_id).await.unwrap().balance;
        let second = fx.sweep.run(when).await.unwrap();
        let after_second = fx.registry.get(&affiliate_id).await.unwrap().balance;

        assert_eq!(first.cleared, 3);
        assert_eq!(second.scanned, 0);
        assert_eq!(second.cleared, 0);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn failing_referral_does_not_stop_the_scan() {
        let fx = fixture(2);
        let t0 = Utc::now();
        let affiliate_id = fx.converted("maria", 4, t0).await;

        let referrals = fx
            .storage
            .list_referrals_for_affiliate(&affiliate_id, Some(CommissionStatus::Pending))
            .await
            .unwrap();
        let poisoned = referrals[1].referral_id.clone();
        fx.storage.fail.lock().unwrap().push(poisoned.clone());

        let report = fx.sweep.run(t0 + Duration::days(30)).await.unwrap();
        assert_eq!(report.cleared, 3);
        assert_eq!(report.failed, vec![poisoned.clone()]);

        let balance = fx.registry.get(&affiliate_id).await.unwrap().balance;
        assert_eq!(balance.pending_minor, 2_000);
        assert_eq!(balance.available_minor, 6_000);

        // the failed commission is retried on the next run
        fx.storage.fail.lock().unwrap().clear();
        let retry = fx.sweep.run(t0 + Duration::days(30)).await.unwrap();
        assert_eq!(retry.cleared, 1);
        assert_eq!(retry.cleared_minor, 2_000);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_before_next_page() {
        let fx = fixture(1);
        let t0 = Utc::now();
        fx.converted("maria", 3, t0).await;

        let (tx, rx) = watch::channel(true);
        let report = fx
            .sweep
            .run_until(t0 + Duration::days(30), Some(&rx))
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);

        tx.send(false).unwrap();
        let report = fx
            .sweep
            .run_until(t0 + Duration::days(30), Some(&rx))
            .await
            .unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.cleared, 3);
    }

    #[tokio::test]
    async fn overlapping_sweep_is_refused() {
        let fx = fixture(10);
        fx.sweep.running.store(true, Ordering::Release);
        let result = fx.sweep.run(Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::SweepAlreadyRunning)));

        fx.sweep.running.store(false, Ordering::Release);
        assert!(fx.sweep.run(Utc::now()).await.is_ok());
        assert!(!fx.sweep.is_running());
    }
}
