use crate::model::{
    ClearingCommit, ClearingCommitted, ClickCommitted, ConversionCommit, ConversionCommitted,
    PayoutCommit, PayoutCommitted,
};
use crate::StorageResult;
use affiliate_types::{
    Affiliate, AffiliateId, AffiliateStatus, CommissionStatus, CustomLink, Payout, PayoutId,
    PayoutPolicy, Referral, ReferralId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Generic query window for offset-paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Keyset page request: rows strictly after `after`, ordered by id.
///
/// Offset paging would skip rows whenever a processed row leaves the
/// filtered result set, so batch scans page by cursor.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub after: Option<ReferralId>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn next_after(&self, last: ReferralId) -> Self {
        Self {
            after: Some(last),
            limit: self.limit,
        }
    }
}

/// Storage interface for affiliate records.
#[async_trait]
pub trait AffiliateStore: Send + Sync {
    /// Insert a new affiliate. Codes are unique case-insensitively.
    async fn create_affiliate(&self, affiliate: Affiliate) -> StorageResult<()>;

    async fn get_affiliate(&self, affiliate_id: &AffiliateId) -> StorageResult<Option<Affiliate>>;

    /// Look up by referral code, ignoring case and surrounding whitespace.
    async fn find_affiliate_by_code(&self, code: &str) -> StorageResult<Option<Affiliate>>;

    async fn set_affiliate_status(
        &self,
        affiliate_id: &AffiliateId,
        status: AffiliateStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn set_payout_policy(
        &self,
        affiliate_id: &AffiliateId,
        policy: PayoutPolicy,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Attach a custom link; slugs are unique per affiliate.
    async fn add_custom_link(
        &self,
        affiliate_id: &AffiliateId,
        link: CustomLink,
    ) -> StorageResult<()>;

    /// List affiliates oldest-first.
    async fn list_affiliates(&self, window: QueryWindow) -> StorageResult<Vec<Affiliate>>;
}

/// Storage interface for referral reads.
#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn get_referral(&self, referral_id: &ReferralId) -> StorageResult<Option<Referral>>;

    /// Most recent `clicked`/`signed_up` referral for the user whose cookie
    /// is still valid at `now`, optionally restricted to one affiliate.
    async fn find_open_referral_for_user(
        &self,
        user_id: &UserId,
        affiliate_id: Option<&AffiliateId>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Referral>>;

    async fn find_referral_by_payment_reference(
        &self,
        reference_id: &str,
    ) -> StorageResult<Option<Referral>>;

    /// Pending commissions with `clears_at <= now`, ordered by referral id.
    async fn list_due_commissions(
        &self,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Referral>>;

    /// Every referral of an affiliate, optionally filtered by commission status.
    async fn list_referrals_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        commission_status: Option<CommissionStatus>,
    ) -> StorageResult<Vec<Referral>>;
}

/// Storage interface for payout records.
#[async_trait]
pub trait PayoutStore: Send + Sync {
    async fn get_payout(&self, payout_id: &PayoutId) -> StorageResult<Option<Payout>>;

    /// List an affiliate's payouts newest-first.
    async fn list_payouts_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Payout>>;
}

/// Multi-document writes committed as one unit.
///
/// Every balance change goes through these operations as an increment
/// against the stored value; none of them take a caller-computed balance.
#[async_trait]
pub trait LedgerCommitStore: Send + Sync {
    /// Insert a `clicked` referral and bump the owning affiliate's counters.
    async fn commit_click(&self, referral: Referral) -> StorageResult<ClickCommitted>;

    /// `clicked -> signed_up`, guarded on status and cookie validity at `at`.
    async fn commit_signup(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StorageResult<Referral>;

    async fn commit_conversion(&self, commit: ConversionCommit)
        -> StorageResult<ConversionCommitted>;

    async fn commit_clearing(&self, commit: ClearingCommit) -> StorageResult<ClearingCommitted>;

    async fn commit_payout(&self, commit: PayoutCommit) -> StorageResult<PayoutCommitted>;
}

/// Unified storage bundle used by the affiliate ledger.
pub trait AffiliateStorage:
    AffiliateStore + ReferralStore + PayoutStore + LedgerCommitStore + Send + Sync
{
}

impl<T> AffiliateStorage for T where
    T: AffiliateStore + ReferralStore + PayoutStore + LedgerCommitStore + Send + Sync
{
}
