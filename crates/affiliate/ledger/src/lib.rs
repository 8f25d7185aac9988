//! Affiliate Ledger - referral attribution and commission accounting.
//!
//! The ledger tracks a referral from an anonymous click through signup and
//! purchase, holds the resulting commission for a clearing window, and batches
//! cleared commissions into payouts. Persistence is delegated to
//! `affiliate-storage`; every balance change is an increment committed
//! atomically by the store under a per-affiliate writer lock.

#![deny(unsafe_code)]

pub mod balance;
pub mod commission;
pub mod config;
mod error;
pub mod locks;
pub mod payout;
pub mod referrals;
pub mod registry;
pub mod sweep;
pub mod tracker;

pub use balance::{BalanceLedger, ReconciliationReport};
pub use commission::CommissionCalculator;
pub use config::{AttributionConfig, CommissionConfig, LedgerConfig, SweepConfig};
pub use error::LedgerError;
pub use locks::AffiliateLocks;
pub use payout::PayoutBatcher;
pub use referrals::{
    ConversionOutcome, ConversionTarget, NotApplicable, ReferralStateMachine, SignupOutcome,
};
pub use registry::{AffiliateRegistry, EnrollAffiliate};
pub use sweep::{ClearingSweep, SweepReport};
pub use tracker::{AttributionTracker, ClickOutcome};

use affiliate_storage::memory::InMemoryAffiliateStorage;
use affiliate_storage::{AffiliateStorage, QueryWindow};
use affiliate_types::{
    Affiliate, AffiliateId, CustomLink, Payout, PayoutId, PayoutPolicy, Purchase, Referral,
    ReferralId, TrackingContext, UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// The affiliate ledger facade.
///
/// Wires the registry, tracker, state machine, sweep and payout batcher to one
/// storage backend and one lock registry. Every time-dependent operation has
/// an `_at` variant taking the clock reading explicitly.
pub struct AffiliateLedger {
    storage: Arc<dyn AffiliateStorage>,
    config: Arc<LedgerConfig>,
    registry: AffiliateRegistry,
    tracker: AttributionTracker,
    referrals: ReferralStateMachine,
    balances: BalanceLedger,
    sweep: ClearingSweep,
    payouts: PayoutBatcher,
}

impl AffiliateLedger {
    /// Create a ledger backed by in-memory storage and default config.
    pub fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryAffiliateStorage::new()))
    }

    /// Create a ledger backed by an explicit storage adapter.
    pub fn with_storage(storage: Arc<dyn AffiliateStorage>) -> Self {
        Self::with_config(storage, LedgerConfig::default())
    }

    pub fn with_config(storage: Arc<dyn AffiliateStorage>, config: LedgerConfig) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(AffiliateLocks::new());
        let lock_timeout = config.sweep.lock_timeout();
        Self {
            registry: AffiliateRegistry::new(Arc::clone(&storage), Arc::clone(&config)),
            tracker: AttributionTracker::new(Arc::clone(&storage)),
            referrals: ReferralStateMachine::new(
                Arc::clone(&storage),
                CommissionCalculator::from_config(&config.commission),
                Arc::clone(&locks),
                lock_timeout,
            ),
            balances: BalanceLedger::new(Arc::clone(&storage)),
            sweep: ClearingSweep::new(
                Arc::clone(&storage),
                Arc::clone(&locks),
                config.sweep.clone(),
            ),
            payouts: PayoutBatcher::new(Arc::clone(&storage), locks, lock_timeout),
            storage,
            config,
        }
    }

    /// Access the underlying storage backend.
    pub fn storage(&self) -> Arc<dyn AffiliateStorage> {
        Arc::clone(&self.storage)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn registry(&self) -> &AffiliateRegistry {
        &self.registry
    }

    pub fn sweep(&self) -> &ClearingSweep {
        &self.sweep
    }

    // ── registry ────────────────────────────────────────────────────

    pub async fn enroll(&self, request: EnrollAffiliate) -> Result<Affiliate, LedgerError> {
        self.registry.enroll(request, Utc::now()).await
    }

    pub async fn get_affiliate(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Affiliate, LedgerError> {
        self.registry.get(affiliate_id).await
    }

    pub async fn find_affiliate_by_code(
        &self,
        code: &str,
    ) -> Result<Option<Affiliate>, LedgerError> {
        self.registry.find_by_code(code).await
    }

    pub async fn list_affiliates(
        &self,
        window: QueryWindow,
    ) -> Result<Vec<Affiliate>, LedgerError> {
        self.registry.list(window).await
    }

    pub async fn suspend(&self, affiliate_id: &AffiliateId) -> Result<Affiliate, LedgerError> {
        self.registry.suspend(affiliate_id, Utc::now()).await
    }

    pub async fn reactivate(&self, affiliate_id: &AffiliateId) -> Result<Affiliate, LedgerError> {
        self.registry.reactivate(affiliate_id, Utc::now()).await
    }

    pub async fn add_custom_link(
        &self,
        affiliate_id: &AffiliateId,
        slug: &str,
        name: &str,
    ) -> Result<CustomLink, LedgerError> {
        self.registry
            .add_custom_link(affiliate_id, slug, name, Utc::now())
            .await
    }

    pub async fn set_payout_policy(
        &self,
        affiliate_id: &AffiliateId,
        policy: PayoutPolicy,
    ) -> Result<Affiliate, LedgerError> {
        self.registry
            .set_payout_policy(affiliate_id, policy, Utc::now())
            .await
    }

    // ── attribution ─────────────────────────────────────────────────

    pub async fn track_click(
        &self,
        code: &str,
        context: TrackingContext,
    ) -> Result<ClickOutcome, LedgerError> {
        self.track_click_at(code, context, Utc::now()).await
    }

    pub async fn track_click_at(
        &self,
        code: &str,
        context: TrackingContext,
        now: DateTime<Utc>,
    ) -> Result<ClickOutcome, LedgerError> {
        self.tracker.track_click(code, context, now).await
    }

    pub async fn get_referral(&self, referral_id: &ReferralId) -> Result<Referral, LedgerError> {
        self.storage
            .get_referral(referral_id)
            .await?
            .ok_or_else(|| LedgerError::ReferralNotFound(referral_id.clone()))
    }

    pub async fn track_signup(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
    ) -> Result<SignupOutcome, LedgerError> {
        self.track_signup_at(referral_id, user_id, Utc::now()).await
    }

    pub async fn track_signup_at(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<SignupOutcome, LedgerError> {
        self.referrals.track_signup(referral_id, user_id, now).await
    }

    pub async fn track_conversion(
        &self,
        target: &ConversionTarget,
        purchase: Purchase,
    ) -> Result<ConversionOutcome, LedgerError> {
        self.track_conversion_at(target, purchase, Utc::now()).await
    }

    pub async fn track_conversion_at(
        &self,
        target: &ConversionTarget,
        purchase: Purchase,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome, LedgerError> {
        self.referrals.track_conversion(target, purchase, now).await
    }

    // ── balances, clearing, payouts ─────────────────────────────────

    pub async fn reconcile(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<ReconciliationReport, LedgerError> {
        self.balances.reconcile(affiliate_id).await
    }

    /// Clear every commission whose clearing date has passed.
    pub async fn process_cleared_commissions(&self) -> Result<SweepReport, LedgerError> {
        self.sweep.run(Utc::now()).await
    }

    pub async fn process_cleared_commissions_at(
        &self,
        now: DateTime<Utc>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport, LedgerError> {
        self.sweep.run_until(now, cancel).await
    }

    pub async fn create_payout(
        &self,
        affiliate_id: &AffiliateId,
        processed_by: &str,
    ) -> Result<Payout, LedgerError> {
        self.create_payout_at(affiliate_id, processed_by, Utc::now())
            .await
    }

    pub async fn create_payout_at(
        &self,
        affiliate_id: &AffiliateId,
        processed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, LedgerError> {
        self.payouts
            .create_payout(affiliate_id, processed_by, now)
            .await
    }

    pub async fn get_payout(&self, payout_id: &PayoutId) -> Result<Option<Payout>, LedgerError> {
        self.payouts.get_payout(payout_id).await
    }

    pub async fn list_payouts(
        &self,
        affiliate_id: &AffiliateId,
        window: QueryWindow,
    ) -> Result<Vec<Payout>, LedgerError> {
        self.registry.get(affiliate_id).await?;
        self.payouts.list_payouts(affiliate_id, window).await
    }
}

impl Default for AffiliateLedger {
    fn default() -> Self {
        Self::new()
    }
}
