use crate::affiliate::PayoutMethod;
use crate::ids::{AffiliateId, PayoutId, ReferralId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Disbursement status. Only `Pending` is produced here; the external
/// disbursement rail moves it to `Processed` or `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processed,
    Failed,
}

/// Span of conversion timestamps covered by a payout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PayoutPeriod {
    /// Smallest period containing every timestamp; `None` when empty.
    pub fn spanning(timestamps: impl IntoIterator<Item = DateTime<Utc>>) -> Option<Self> {
        timestamps.into_iter().fold(None, |period, at| match period {
            None => Some(Self { start: at, end: at }),
            Some(Self { start, end }) => Some(Self {
                start: start.min(at),
                end: end.max(at),
            }),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutBreakdown {
    /// Sum of the settled commission amounts.
    pub gross_minor: u64,
    pub fees_minor: u64,
    /// `amount - gross`; non-zero only if the stored balance drifted.
    pub adjustments_minor: i64,
    pub referral_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payout {
    pub payout_id: PayoutId,
    pub affiliate_id: AffiliateId,
    pub amount_minor: u64,
    pub method: PayoutMethod,
    #[serde(default)]
    pub destination: Option<String>,
    pub status: PayoutStatus,
    pub period: PayoutPeriod,
    pub breakdown: PayoutBreakdown,
    pub referral_ids: Vec<ReferralId>,
    pub processed_by: String,
    pub created_at: DateTime<Utc>,
}
