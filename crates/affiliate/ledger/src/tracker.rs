use crate::LedgerError;
use affiliate_storage::AffiliateStorage;
use affiliate_types::{
    normalize_code, AffiliateId, Referral, ReferralId, ReferralStatus, TrackingContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a tracked click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClickOutcome {
    Attributed {
        referral_id: ReferralId,
        affiliate_id: AffiliateId,
        cookie_expires_at: DateTime<Utc>,
        link_matched: bool,
    },
    /// Unknown or inactive code. Nothing was written.
    NoAttribution,
}

impl ClickOutcome {
    pub fn is_attributed(&self) -> bool {
        matches!(self, Self::Attributed { .. })
    }
}

/// Ingests clicks and opens referrals.
pub struct AttributionTracker {
    storage: Arc<dyn AffiliateStorage>,
}

impl AttributionTracker {
    pub fn new(storage: Arc<dyn AffiliateStorage>) -> Self {
        Self { storage }
    }

    pub async fn track_click(
        &self,
        code: &str,
        mut context: TrackingContext,
        now: DateTime<Utc>,
    ) -> Result<ClickOutcome, LedgerError> {
        let affiliate = match self.storage.find_affiliate_by_code(code).await? {
            Some(affiliate) if affiliate.is_active() => affiliate,
            Some(affiliate) => {
                tracing::debug!(
                    affiliate_id = %affiliate.affiliate_id,
                    "Click for suspended affiliate ignored"
                );
                return Ok(ClickOutcome::NoAttribution);
            }
            None => {
                tracing::debug!(code = %code, "Click with unknown code ignored");
                return Ok(ClickOutcome::NoAttribution);
            }
        };

        if context.source_code.is_empty() {
            context.source_code = code.to_string();
        }
        context.link_slug = context
            .link_slug
            .as_deref()
            .map(normalize_code)
            .filter(|slug| !slug.is_empty());
        let Some(cookie_expires_at) =
            now.checked_add_signed(affiliate.attribution.cookie_window())
        else {
            return Err(LedgerError::InvalidInput(format!(
                "cookie window of {} days overflows the click time",
                affiliate.attribution.cookie_days
            )));
        };
        let referral = Referral {
            referral_id: ReferralId::generate(),
            affiliate_id: affiliate.affiliate_id.clone(),
            status: ReferralStatus::Clicked,
            tracking: context,
            clicked_at: now,
            cookie_expires_at,
            referred_user_id: None,
            signed_up_at: None,
            purchase: None,
            commission: None,
            converted_at: None,
            updated_at: now,
        };
        let referral_id = referral.referral_id.clone();

        let committed = self.storage.commit_click(referral).await?;
        tracing::info!(
            affiliate_id = %affiliate.affiliate_id,
            referral_id = %referral_id,
            total_referrals = committed.stats.total_referrals,
            link_matched = committed.link_matched,
            "Click attributed"
        );

        Ok(ClickOutcome::Attributed {
            referral_id,
            affiliate_id: affiliate.affiliate_id,
            cookie_expires_at,
            link_matched: committed.link_matched,
        })
    }
}
