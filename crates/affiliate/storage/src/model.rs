use affiliate_types::{
    AffiliateStats, BalanceApplied, BalanceMovement, Commission, Payout, Purchase, Referral,
    ReferralId, ReferralStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of inserting a clicked referral and bumping the affiliate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickCommitted {
    pub stats: AffiliateStats,
    /// Whether the click's slug matched one of the affiliate's custom links.
    pub link_matched: bool,
}

/// Conversion written as one unit: referral patch, accrual, stats.
///
/// The store rejects the commit unless the referral is still in
/// `expected_from` with an unexpired cookie at `converted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionCommit {
    pub referral_id: ReferralId,
    pub expected_from: ReferralStatus,
    pub purchase: Purchase,
    pub commission: Commission,
    pub movement: BalanceMovement,
    pub converted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionCommitted {
    pub referral: Referral,
    pub balance: BalanceApplied,
    pub stats: AffiliateStats,
}

/// Clearing of one pending commission, guarded on `pending` and `clears_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearingCommit {
    pub referral_id: ReferralId,
    pub movement: BalanceMovement,
    pub cleared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearingCommitted {
    pub referral: Referral,
    pub balance: BalanceApplied,
}

/// Payout insertion plus settlement of every referral it names.
///
/// All referrals must still hold a `cleared` commission; otherwise nothing
/// is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutCommit {
    pub payout: Payout,
    pub movement: BalanceMovement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutCommitted {
    pub payout: Payout,
    pub balance: BalanceApplied,
}
