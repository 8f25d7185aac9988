use crate::config::LedgerConfig;
use crate::LedgerError;
use affiliate_storage::{AffiliateStorage, QueryWindow, StorageError};
use affiliate_types::{
    normalize_code, Affiliate, AffiliateId, AffiliateStats, AffiliateStatus, AttributionPolicy,
    Balance, CommissionRates, CustomLink, PayoutPolicy, PurchaseCategory, MAX_COOKIE_DAYS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_CODE_LEN: usize = 64;

/// Enrollment request; omitted fields take the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollAffiliate {
    pub code: String,
    pub display_name: String,
    #[serde(default)]
    pub commission_rates: Option<CommissionRates>,
    #[serde(default)]
    pub cookie_days: Option<u32>,
    #[serde(default)]
    pub payout: Option<PayoutPolicy>,
}

/// Owns affiliate records.
pub struct AffiliateRegistry {
    storage: Arc<dyn AffiliateStorage>,
    config: Arc<LedgerConfig>,
}

impl AffiliateRegistry {
    pub fn new(storage: Arc<dyn AffiliateStorage>, config: Arc<LedgerConfig>) -> Self {
        Self { storage, config }
    }

    pub async fn enroll(
        &self,
        request: EnrollAffiliate,
        now: DateTime<Utc>,
    ) -> Result<Affiliate, LedgerError> {
        let code = validate_code(&request.code)?;
        if request.display_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "display name must not be empty".to_string(),
            ));
        }

        let commission_rates = request
            .commission_rates
            .unwrap_or_else(|| self.default_rates());
        if let Some((category, rate)) = commission_rates.iter().find(|(_, rate)| !rate.is_valid())
        {
            return Err(LedgerError::InvalidInput(format!(
                "commission rate {rate} for {category:?} exceeds 100%"
            )));
        }

        let cookie_days = request
            .cookie_days
            .unwrap_or(self.config.attribution.cookie_days);
        if !(1..=MAX_COOKIE_DAYS).contains(&cookie_days) {
            return Err(LedgerError::InvalidInput(format!(
                "cookie days must be between 1 and {MAX_COOKIE_DAYS}, got {cookie_days}"
            )));
        }

        if self.storage.find_affiliate_by_code(&code).await?.is_some() {
            return Err(LedgerError::CodeTaken(code));
        }

        let affiliate = Affiliate {
            affiliate_id: AffiliateId::generate(),
            code: code.clone(),
            display_name: request.display_name.trim().to_string(),
            status: AffiliateStatus::Active,
            commission_rates,
            attribution: AttributionPolicy { cookie_days },
            payout: request.payout.unwrap_or_else(|| PayoutPolicy {
                method: None,
                destination: None,
                minimum_payout_minor: self.config.commission.default_minimum_payout_minor,
            }),
            balance: Balance::default(),
            stats: AffiliateStats::default(),
            custom_links: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        match self.storage.create_affiliate(affiliate.clone()).await {
            Ok(()) => {}
            // lost a race with another enrollment of the same code
            Err(StorageError::Conflict(_)) => return Err(LedgerError::CodeTaken(code)),
            Err(err) => return Err(err.into()),
        }

        tracing::info!(
            affiliate_id = %affiliate.affiliate_id,
            code = %affiliate.code,
            cookie_days = affiliate.attribution.cookie_days,
            "Affiliate enrolled"
        );
        Ok(affiliate)
    }

    pub async fn get(&self, affiliate_id: &AffiliateId) -> Result<Affiliate, LedgerError> {
        self.storage
            .get_affiliate(affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::AffiliateNotFound(affiliate_id.clone()))
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<Affiliate>, LedgerError> {
        Ok(self.storage.find_affiliate_by_code(code).await?)
    }

    pub async fn list(&self, window: QueryWindow) -> Result<Vec<Affiliate>, LedgerError> {
        Ok(self.storage.list_affiliates(window).await?)
    }

    pub async fn suspend(
        &self,
        affiliate_id: &AffiliateId,
        now: DateTime<Utc>,
    ) -> Result<Affiliate, LedgerError> {
        self.set_status(affiliate_id, AffiliateStatus::Suspended, now)
            .await
    }

    pub async fn reactivate(
        &self,
        affiliate_id: &AffiliateId,
        now: DateTime<Utc>,
    ) -> Result<Affiliate, LedgerError> {
        self.set_status(affiliate_id, AffiliateStatus::Active, now)
            .await
    }

    async fn set_status(
        &self,
        affiliate_id: &AffiliateId,
        status: AffiliateStatus,
        now: DateTime<Utc>,
    ) -> Result<Affiliate, LedgerError> {
        let current = self.get(affiliate_id).await?;
        if current.status == status {
            return Ok(current);
        }
        self.storage
            .set_affiliate_status(affiliate_id, status, now)
            .await?;
        tracing::info!(affiliate_id = %affiliate_id, status = ?status, "Affiliate status changed");
        self.get(affiliate_id).await
    }

    pub async fn add_custom_link(
        &self,
        affiliate_id: &AffiliateId,
        slug: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<CustomLink, LedgerError> {
        let slug = validate_code(slug)?;
        let affiliate = self.get(affiliate_id).await?;
        let link_exists = || LedgerError::LinkExists {
            affiliate_id: affiliate_id.clone(),
            slug: slug.clone(),
        };
        if affiliate.link(&slug).is_some() {
            return Err(link_exists());
        }

        let link = CustomLink {
            slug: slug.clone(),
            name: if name.trim().is_empty() {
                slug.clone()
            } else {
                name.trim().to_string()
            },
            clicks: 0,
            created_at: now,
        };
        match self
            .storage
            .add_custom_link(affiliate_id, link.clone())
            .await
        {
            Ok(()) => Ok(link),
            Err(StorageError::Conflict(_)) => Err(link_exists()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn set_payout_policy(
        &self,
        affiliate_id: &AffiliateId,
        policy: PayoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Affiliate, LedgerError> {
        self.get(affiliate_id).await?;
        self.storage
            .set_payout_policy(affiliate_id, policy, now)
            .await?;
        self.get(affiliate_id).await
    }

    fn default_rates(&self) -> CommissionRates {
        let rate = self.config.commission.default_rate;
        CommissionRates::empty()
            .with_rate(PurchaseCategory::Courses, rate)
            .with_rate(PurchaseCategory::Bundles, rate)
            .with_rate(PurchaseCategory::Subscriptions, rate)
    }
}

/// Normalize and validate a referral code or link slug: `[a-z0-9_-]+`.
pub fn validate_code(raw: &str) -> Result<String, LedgerError> {
    let code = normalize_code(raw);
    let well_formed = !code.is_empty()
        && code.len() <= MAX_CODE_LEN
        && code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if well_formed {
        Ok(code)
    } else {
        Err(LedgerError::InvalidCode(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affiliate_storage::memory::InMemoryAffiliateStorage;
    use affiliate_types::{CommissionRate, PayoutMethod};

    fn registry() -> AffiliateRegistry {
        AffiliateRegistry::new(
            Arc::new(InMemoryAffiliateStorage::new()),
            Arc::new(LedgerConfig::default()),
        )
    }

    fn request(code: &str) -> EnrollAffiliate {
        EnrollAffiliate {
            code: code.to_string(),
            display_name: "Maria Lopez".to_string(),
            ..EnrollAffiliate::default()
        }
    }

    #[tokio::test]
    async fn enrollment_fills_defaults_and_normalizes_code() {
        let registry = registry();
        let affiliate = registry
            .enroll(request("  Maria-2024 "), Utc::now())
            .await
            .unwrap();

        assert_eq!(affiliate.code, "maria-2024");
        assert_eq!(affiliate.attribution.cookie_days, 30);
        assert_eq!(
            affiliate.commission_rates.rate_for(PurchaseCategory::Bundles),
            Some(CommissionRate::from_percent(20))
        );
        assert_eq!(affiliate.balance, Balance::default());
        assert!(affiliate.is_active());

        let found = registry.find_by_code("MARIA-2024").await.unwrap();
        assert_eq!(found.map(|a| a.affiliate_id), Some(affiliate.affiliate_id));
    }

    #[tokio::test]
    async fn cookie_window_outside_bounds_is_rejected() {
        let registry = registry();
        for days in [0, MAX_COOKIE_DAYS + 1, u32::MAX] {
            let mut req = request("wide");
            req.cookie_days = Some(days);
            assert!(matches!(
                registry.enroll(req, Utc::now()).await,
                Err(LedgerError::InvalidInput(_))
            ));
        }
        assert!(registry.find_by_code("wide").await.unwrap().is_none());

        let mut req = request("wide");
        req.cookie_days = Some(MAX_COOKIE_DAYS);
        let affiliate = registry.enroll(req, Utc::now()).await.unwrap();
        assert_eq!(affiliate.attribution.cookie_days, MAX_COOKIE_DAYS);
    }

    #[tokio::test]
    async fn duplicate_code_is_rejected_case_insensitively() {
        let registry = registry();
        registry.enroll(request("maria"), Utc::now()).await.unwrap();
        let result = registry.enroll(request("MARIA"), Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::CodeTaken(code)) if code == "maria"));
    }

    #[tokio::test]
    async fn malformed_codes_and_rates_are_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.enroll(request("no spaces"), Utc::now()).await,
            Err(LedgerError::InvalidCode(_))
        ));
        assert!(matches!(
            registry.enroll(request(""), Utc::now()).await,
            Err(LedgerError::InvalidCode(_))
        ));

        let mut greedy = request("greedy");
        greedy.commission_rates = Some(
            CommissionRates::empty()
                .with_rate(PurchaseCategory::Courses, CommissionRate::from_bps(10_001)),
        );
        assert!(matches!(
            registry.enroll(greedy, Utc::now()).await,
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn suspend_and_reactivate() {
        let registry = registry();
        let affiliate = registry.enroll(request("maria"), Utc::now()).await.unwrap();

        let suspended = registry
            .suspend(&affiliate.affiliate_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(suspended.status, AffiliateStatus::Suspended);

        let active = registry
            .reactivate(&affiliate.affiliate_id, Utc::now())
            .await
            .unwrap();
        assert!(active.is_active());

        let missing = registry
            .suspend(&AffiliateId::new("missing"), Utc::now())
            .await;
        assert!(matches!(missing, Err(LedgerError::AffiliateNotFound(_))));
    }

    #[tokio::test]
    async fn custom_link_slugs_are_unique_per_affiliate() {
        let registry = registry();
        let maria = registry.enroll(request("maria"), Utc::now()).await.unwrap();
        let jon = registry.enroll(request("jon"), Utc::now()).await.unwrap();

        let link = registry
            .add_custom_link(&maria.affiliate_id, "Spring-Sale", "Spring sale", Utc::now())
            .await
            .unwrap();
        assert_eq!(link.slug, "spring-sale");

        let again = registry
            .add_custom_link(&maria.affiliate_id, "spring-sale", "", Utc::now())
            .await;
        assert!(matches!(again, Err(LedgerError::LinkExists { .. })));

        // other affiliates may reuse the slug
        registry
            .add_custom_link(&jon.affiliate_id, "spring-sale", "", Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn payout_policy_update_is_persisted() {
        let registry = registry();
        let affiliate = registry.enroll(request("maria"), Utc::now()).await.unwrap();
        let updated = registry
            .set_payout_policy(
                &affiliate.affiliate_id,
                PayoutPolicy {
                    method: Some(PayoutMethod::Paypal),
                    destination: Some("maria@example.com".to_string()),
                    minimum_payout_minor: 2_500,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(updated.payout.method, Some(PayoutMethod::Paypal));
        assert_eq!(updated.payout.minimum_payout_minor, 2_500);
    }
}
