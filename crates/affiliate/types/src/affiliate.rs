use crate::balance::Balance;
use crate::ids::AffiliateId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Commission rate applied when a category has no entry in the rate table.
pub const DEFAULT_COMMISSION_RATE: CommissionRate = CommissionRate::from_percent(20);

/// Attribution window used when enrollment does not specify one.
pub const DEFAULT_COOKIE_DAYS: u32 = 30;

/// Longest attribution window an affiliate may be enrolled with.
pub const MAX_COOKIE_DAYS: u32 = 3_650;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateStatus {
    Active,
    Suspended,
}

/// Purchase category used to look up the commission rate.
///
/// Unknown category strings deserialize to `Other`, which never has a
/// configured rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseCategory {
    Courses,
    Bundles,
    Subscriptions,
    #[serde(other)]
    Other,
}

/// Commission rate in basis points (`2000` = 20%).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRate(u32);

impl CommissionRate {
    pub const MAX_BPS: u32 = 10_000;

    pub const fn from_bps(bps: u32) -> Self {
        Self(bps)
    }

    pub const fn from_percent(percent: u32) -> Self {
        Self(percent * 100)
    }

    pub fn bps(self) -> u32 {
        self.0
    }

    /// Rates above 100% are rejected at enrollment.
    pub fn is_valid(self) -> bool {
        self.0 <= Self::MAX_BPS
    }

    /// `round(amount * rate / 100)` in integer minor units, rounding half up.
    pub fn commission_for(self, amount_minor: u64) -> u64 {
        let scaled = u128::from(amount_minor) * u128::from(self.0);
        let rounded = (scaled + u128::from(Self::MAX_BPS / 2)) / u128::from(Self::MAX_BPS);
        u64::try_from(rounded).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Display for CommissionRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Per-category commission table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRates(pub BTreeMap<PurchaseCategory, CommissionRate>);

impl CommissionRates {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_rate(mut self, category: PurchaseCategory, rate: CommissionRate) -> Self {
        self.0.insert(category, rate);
        self
    }

    /// Configured rate for a category. `Other` is never mapped.
    pub fn rate_for(&self, category: PurchaseCategory) -> Option<CommissionRate> {
        if category == PurchaseCategory::Other {
            return None;
        }
        self.0.get(&category).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PurchaseCategory, &CommissionRate)> {
        self.0.iter()
    }
}

impl Default for CommissionRates {
    fn default() -> Self {
        Self::empty()
            .with_rate(PurchaseCategory::Courses, DEFAULT_COMMISSION_RATE)
            .with_rate(PurchaseCategory::Bundles, DEFAULT_COMMISSION_RATE)
            .with_rate(PurchaseCategory::Subscriptions, DEFAULT_COMMISSION_RATE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionPolicy {
    pub cookie_days: u32,
}

impl AttributionPolicy {
    pub fn cookie_window(&self) -> Duration {
        Duration::days(i64::from(self.cookie_days))
    }
}

impl Default for AttributionPolicy {
    fn default() -> Self {
        Self {
            cookie_days: DEFAULT_COOKIE_DAYS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Paypal,
    Stripe,
    BankTransfer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPolicy {
    pub method: Option<PayoutMethod>,
    /// Free-form destination (account email, connected account id, IBAN).
    #[serde(default)]
    pub destination: Option<String>,
    pub minimum_payout_minor: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub total_referrals: u64,
    pub converted_referrals: u64,
    pub total_revenue_minor: u64,
    /// Whole percent, rounded half up.
    pub conversion_rate: u32,
    pub last_referral_at: Option<DateTime<Utc>>,
}

impl AffiliateStats {
    pub fn record_click(&mut self, at: DateTime<Utc>) {
        self.total_referrals = self.total_referrals.saturating_add(1);
        self.last_referral_at = Some(at);
    }

    pub fn record_conversion(&mut self, revenue_minor: u64) {
        self.converted_referrals = self.converted_referrals.saturating_add(1);
        self.total_revenue_minor = self.total_revenue_minor.saturating_add(revenue_minor);
        self.conversion_rate = conversion_rate(self.converted_referrals, self.total_referrals);
    }
}

/// `round(converted / total * 100)`; zero when nothing was tracked.
pub fn conversion_rate(converted: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    let numerator = u128::from(converted) * 200 + u128::from(total);
    let rate = numerator / (u128::from(total) * 2);
    u32::try_from(rate).unwrap_or(u32::MAX)
}

/// Named tracking link owned by an affiliate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomLink {
    pub slug: String,
    pub name: String,
    pub clicks: u64,
    pub created_at: DateTime<Utc>,
}

/// Affiliate record as stored in the document store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Affiliate {
    pub affiliate_id: AffiliateId,
    /// Normalized referral code, see [`normalize_code`].
    pub code: String,
    pub display_name: String,
    pub status: AffiliateStatus,
    pub commission_rates: CommissionRates,
    pub attribution: AttributionPolicy,
    pub payout: PayoutPolicy,
    pub balance: Balance,
    pub stats: AffiliateStats,
    #[serde(default)]
    pub custom_links: Vec<CustomLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Affiliate {
    pub fn is_active(&self) -> bool {
        self.status == AffiliateStatus::Active
    }

    pub fn link(&self, slug: &str) -> Option<&CustomLink> {
        self.custom_links.iter().find(|link| link.slug == slug)
    }

    pub fn link_mut(&mut self, slug: &str) -> Option<&mut CustomLink> {
        self.custom_links.iter_mut().find(|link| link.slug == slug)
    }
}

/// Codes compare case-insensitively; the store only ever sees this form.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}
