//! Affiliate ledger types.
//!
//! Records shared by the storage adapters and the ledger: affiliates with
//! their three-part balance, referrals with their commission, and payouts.
//! Every status is a closed enum so transition legality is an exhaustive
//! match rather than a string comparison.

#![deny(unsafe_code)]

pub mod affiliate;
pub mod balance;
pub mod ids;
pub mod payout;
pub mod referral;

pub use affiliate::{
    conversion_rate, normalize_code, Affiliate, AffiliateStats, AffiliateStatus,
    AttributionPolicy, CommissionRate, CommissionRates, CustomLink, PayoutMethod, PayoutPolicy,
    PurchaseCategory, DEFAULT_COMMISSION_RATE, DEFAULT_COOKIE_DAYS, MAX_COOKIE_DAYS,
};
pub use balance::{Balance, BalanceApplied, BalanceMovement};
pub use ids::{AffiliateId, PayoutId, ReferralId, UserId};
pub use payout::{Payout, PayoutBreakdown, PayoutPeriod, PayoutStatus};
pub use referral::{
    ClientMetadata, Commission, CommissionStatus, Purchase, Referral, ReferralStatus,
    TrackingContext, UtmParams,
};
