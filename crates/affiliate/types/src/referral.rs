use crate::affiliate::{CommissionRate, PurchaseCategory};
use crate::ids::{AffiliateId, PayoutId, ReferralId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Referral lifecycle.
///
/// Ordered `clicked < signed_up < converted < paid`. `clicked -> converted`
/// is a valid shortcut; nothing ever moves backwards and `paid` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Clicked,
    SignedUp,
    Converted,
    Paid,
}

impl ReferralStatus {
    pub fn rank(self) -> u8 {
        match self {
            Self::Clicked => 0,
            Self::SignedUp => 1,
            Self::Converted => 2,
            Self::Paid => 3,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Clicked, Self::SignedUp)
                | (Self::Clicked, Self::Converted)
                | (Self::SignedUp, Self::Converted)
                | (Self::Converted, Self::Paid)
        )
    }

    /// Statuses from which a purchase can still be attributed.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Clicked | Self::SignedUp)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Paid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clicked => "clicked",
            Self::SignedUp => "signed_up",
            Self::Converted => "converted",
            Self::Paid => "paid",
        }
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commission lifecycle: `pending -> cleared -> paid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Cleared,
    Paid,
}

impl CommissionStatus {
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Cleared) | (Self::Cleared, Self::Paid)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cleared => "cleared",
            Self::Paid => "paid",
        }
    }
}

impl std::fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer_url: Option<String>,
    pub landing_page: Option<String>,
}

/// Context captured with a click.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingContext {
    /// Code exactly as it arrived on the request.
    pub source_code: String,
    #[serde(default)]
    pub link_slug: Option<String>,
    #[serde(default)]
    pub utm: UtmParams,
    #[serde(default)]
    pub client: ClientMetadata,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub category: PurchaseCategory,
    /// External payment reference; unique across attributed referrals.
    pub reference_id: String,
    pub amount_minor: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub rate: CommissionRate,
    /// Fixed at conversion; only `status` and its timestamps move afterwards.
    pub amount_minor: u64,
    pub status: CommissionStatus,
    pub clears_at: DateTime<Utc>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payout_id: Option<PayoutId>,
}

impl Commission {
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CommissionStatus::Pending && self.clears_at <= now
    }
}

/// One tracked attribution, from click to (optionally) a paid commission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Referral {
    pub referral_id: ReferralId,
    pub affiliate_id: AffiliateId,
    pub status: ReferralStatus,
    pub tracking: TrackingContext,
    pub clicked_at: DateTime<Utc>,
    pub cookie_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub referred_user_id: Option<UserId>,
    #[serde(default)]
    pub signed_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase: Option<Purchase>,
    #[serde(default)]
    pub commission: Option<Commission>,
    #[serde(default)]
    pub converted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Referral {
    /// The cookie is valid strictly before its expiry instant.
    pub fn cookie_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.cookie_expires_at
    }

    /// Whether a signup or purchase could still be attributed to this referral.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.cookie_valid_at(now)
    }

    pub fn commission_status(&self) -> Option<CommissionStatus> {
        self.commission.as_ref().map(|commission| commission.status)
    }

    pub fn commission_amount_minor(&self) -> u64 {
        self.commission
            .as_ref()
            .map(|commission| commission.amount_minor)
            .unwrap_or(0)
    }
}
