//! Referral state machine: `clicked -> signed_up -> converted -> paid`.
//!
//! Signup and conversion are gated on status and cookie validity. Requests
//! that do not qualify come back as `NotApplicable` with a reason and write
//! nothing.

use crate::balance::BalanceLedger;
use crate::commission::CommissionCalculator;
use crate::locks::AffiliateLocks;
use crate::LedgerError;
use affiliate_storage::{AffiliateStorage, ConversionCommit, StorageError};
use affiliate_types::{
    AffiliateId, CommissionRate, Purchase, Referral, ReferralId, ReferralStatus, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Why a signup or conversion was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotApplicable {
    UnknownReferral,
    UnknownAffiliate,
    NoOpenReferral,
    CookieExpired,
    AlreadyAdvanced,
    AffiliateInactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignupOutcome {
    SignedUp {
        referral_id: ReferralId,
        signed_up_at: DateTime<Utc>,
    },
    NotApplicable {
        reason: NotApplicable,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted {
        referral_id: ReferralId,
        affiliate_id: AffiliateId,
        rate: CommissionRate,
        commission_minor: u64,
        clears_at: DateTime<Utc>,
    },
    NotApplicable {
        reason: NotApplicable,
    },
    /// The payment reference already produced a commission; nothing changed.
    AlreadyAttributed { referral_id: ReferralId },
}

/// How a purchase is matched to a referral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ConversionTarget {
    Referral {
        referral_id: ReferralId,
    },
    /// Most recent open referral of the user, optionally for one affiliate.
    User {
        user_id: UserId,
        #[serde(default)]
        affiliate_code: Option<String>,
    },
}

/// Advances referrals and accrues commissions.
pub struct ReferralStateMachine {
    storage: Arc<dyn AffiliateStorage>,
    calculator: CommissionCalculator,
    locks: Arc<AffiliateLocks>,
    lock_timeout: Duration,
}

impl ReferralStateMachine {
    pub fn new(
        storage: Arc<dyn AffiliateStorage>,
        calculator: CommissionCalculator,
        locks: Arc<AffiliateLocks>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            calculator,
            locks,
            lock_timeout,
        }
    }

    pub async fn track_signup(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<SignupOutcome, LedgerError> {
        let Some(referral) = self.storage.get_referral(referral_id).await? else {
            return Ok(signup_skipped(referral_id, NotApplicable::UnknownReferral));
        };
        if referral.status != ReferralStatus::Clicked {
            return Ok(signup_skipped(referral_id, NotApplicable::AlreadyAdvanced));
        }
        if !referral.cookie_valid_at(now) {
            return Ok(signup_skipped(referral_id, NotApplicable::CookieExpired));
        }

        match self.storage.commit_signup(referral_id, user_id, now).await {
            Ok(updated) => {
                tracing::info!(
                    affiliate_id = %updated.affiliate_id,
                    referral_id = %referral_id,
                    "Referral signed up"
                );
                Ok(SignupOutcome::SignedUp {
                    referral_id: referral_id.clone(),
                    signed_up_at: now,
                })
            }
            Err(StorageError::PreconditionFailed(_)) => {
                Ok(signup_skipped(referral_id, NotApplicable::AlreadyAdvanced))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn track_conversion(
        &self,
        target: &ConversionTarget,
        purchase: Purchase,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome, LedgerError> {
        if purchase.reference_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "payment reference must not be empty".to_string(),
            ));
        }
        if let Some(existing) = self
            .storage
            .find_referral_by_payment_reference(&purchase.reference_id)
            .await?
        {
            return Ok(already_attributed(&purchase, existing.referral_id));
        }

        let referral = match self.resolve(target, now).await? {
            Ok(referral) => referral,
            Err(reason) => return Ok(conversion_skipped(target, reason)),
        };
        let affiliate_id = referral.affiliate_id.clone();

        let _guard = self.locks.lock_within(&affiliate_id, self.lock_timeout).await?;
        let Some(affiliate) = self.storage.get_affiliate(&affiliate_id).await? else {
            return Ok(conversion_skipped(target, NotApplicable::UnknownAffiliate));
        };
        if !affiliate.is_active() {
            return Ok(conversion_skipped(target, NotApplicable::AffiliateInactive));
        }

        let commission = self.calculator.calculate(&affiliate, &purchase, now)?;
        let commit = ConversionCommit {
            referral_id: referral.referral_id.clone(),
            expected_from: referral.status,
            movement: BalanceLedger::accrual(commission.amount_minor),
            purchase: purchase.clone(),
            commission: commission.clone(),
            converted_at: now,
        };

        let committed = match self.storage.commit_conversion(commit).await {
            Ok(committed) => committed,
            Err(StorageError::DuplicatePaymentReference(_)) => {
                return match self
                    .storage
                    .find_referral_by_payment_reference(&purchase.reference_id)
                    .await?
                {
                    Some(existing) => Ok(already_attributed(&purchase, existing.referral_id)),
                    None => Err(LedgerError::Conflict(format!(
                        "payment reference {} collided but is not attributed",
                        purchase.reference_id
                    ))),
                };
            }
            Err(StorageError::PreconditionFailed(_)) => {
                return Ok(conversion_skipped(target, NotApplicable::AlreadyAdvanced));
            }
            Err(err) => return Err(err.into()),
        };
        BalanceLedger::observe(&affiliate_id, "conversion", &committed.balance);

        tracing::info!(
            affiliate_id = %affiliate_id,
            referral_id = %referral.referral_id,
            amount_minor = purchase.amount_minor,
            commission_minor = commission.amount_minor,
            rate = %commission.rate,
            conversion_rate = committed.stats.conversion_rate,
            "Referral converted"
        );

        Ok(ConversionOutcome::Converted {
            referral_id: referral.referral_id,
            affiliate_id,
            rate: commission.rate,
            commission_minor: commission.amount_minor,
            clears_at: commission.clears_at,
        })
    }

    async fn resolve(
        &self,
        target: &ConversionTarget,
        now: DateTime<Utc>,
    ) -> Result<Result<Referral, NotApplicable>, LedgerError> {
        match target {
            ConversionTarget::Referral { referral_id } => {
                let Some(referral) = self.storage.get_referral(referral_id).await? else {
                    return Ok(Err(NotApplicable::UnknownReferral));
                };
                if !referral.status.is_open() {
                    return Ok(Err(NotApplicable::AlreadyAdvanced));
                }
                if !referral.cookie_valid_at(now) {
                    return Ok(Err(NotApplicable::CookieExpired));
                }
                Ok(Ok(referral))
            }
            ConversionTarget::User {
                user_id,
                affiliate_code,
            } => {
                let affiliate_id = match affiliate_code {
                    Some(code) => match self.storage.find_affiliate_by_code(code).await? {
                        Some(affiliate) => Some(affiliate.affiliate_id),
                        None => return Ok(Err(NotApplicable::UnknownAffiliate)),
                    },
                    None => None,
                };
                Ok(self
                    .storage
                    .find_open_referral_for_user(user_id, affiliate_id.as_ref(), now)
                    .await?
                    .ok_or(NotApplicable::NoOpenReferral))
            }
        }
    }
}

fn signup_skipped(referral_id: &ReferralId, reason: NotApplicable) -> SignupOutcome {
    tracing::debug!(referral_id = %referral_id, reason = ?reason, "Signup not applicable");
    SignupOutcome::NotApplicable { reason }
}

fn conversion_skipped(target: &ConversionTarget, reason: NotApplicable) -> ConversionOutcome {
    tracing::debug!(target = ?target, reason = ?reason, "Conversion not applicable");
    ConversionOutcome::NotApplicable { reason }
}

fn already_attributed(purchase: &Purchase, referral_id: ReferralId) -> ConversionOutcome {
    tracing::info!(
        referral_id = %referral_id,
        payment_reference = %purchase.reference_id,
        "Payment reference already attributed"
    );
    ConversionOutcome::AlreadyAttributed { referral_id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::registry::{AffiliateRegistry, EnrollAffiliate};
    use crate::tracker::{AttributionTracker, ClickOutcome};
    use affiliate_storage::ReferralStore;
    use affiliate_storage::memory::InMemoryAffiliateStorage;
    use affiliate_types::{CommissionStatus, PurchaseCategory, TrackingContext};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        storage: Arc<InMemoryAffiliateStorage>,
        registry: AffiliateRegistry,
        tracker: AttributionTracker,
        machine: ReferralStateMachine,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryAffiliateStorage::new());
        let config = Arc::new(LedgerConfig::default());
        Fixture {
            registry: AffiliateRegistry::new(storage.clone(), config.clone()),
            tracker: AttributionTracker::new(storage.clone()),
            machine: ReferralStateMachine::new(
                storage.clone(),
                CommissionCalculator::from_config(&config.commission),
                Arc::new(AffiliateLocks::new()),
                config.sweep.lock_timeout(),
            ),
            storage,
        }
    }

    impl Fixture {
        async fn enroll(&self, code: &str) -> AffiliateId {
            self.registry
                .enroll(
                    EnrollAffiliate {
                        code: code.to_string(),
                        display_name: code.to_string(),
                        ..EnrollAffiliate::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap()
                .affiliate_id
        }

        async fn click(&self, code: &str, at: DateTime<Utc>) -> ReferralId {
            match self
                .tracker
                .track_click(code, TrackingContext::default(), at)
                .await
                .unwrap()
            {
                ClickOutcome::Attributed { referral_id, .. } => referral_id,
                ClickOutcome::NoAttribution => panic!("click was not attributed"),
            }
        }
    }

    fn purchase(reference: &str, amount_minor: u64) -> Purchase {
        Purchase {
            category: PurchaseCategory::Courses,
            reference_id: reference.to_string(),
            amount_minor,
        }
    }

    #[tokio::test]
    async fn signup_after_cookie_expiry_is_not_applicable() {
        let fx = fixture();
        fx.enroll("maria").await;
        let t0 = Utc::now();
        let referral_id = fx.click("maria", t0).await;

        let late = t0 + ChronoDuration::days(30);
        let outcome = fx
            .machine
            .track_signup(&referral_id, &UserId::new("u1"), late)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignupOutcome::NotApplicable {
                reason: NotApplicable::CookieExpired
            }
        );

        let on_time = t0 + ChronoDuration::days(29);
        let outcome = fx
            .machine
            .track_signup(&referral_id, &UserId::new("u1"), on_time)
            .await
            .unwrap();
        assert!(matches!(outcome, SignupOutcome::SignedUp { .. }));

        let again = fx
            .machine
            .track_signup(&referral_id, &UserId::new("u1"), on_time)
            .await
            .unwrap();
        assert_eq!(
            again,
            SignupOutcome::NotApplicable {
                reason: NotApplicable::AlreadyAdvanced
            }
        );
    }

    #[tokio::test]
    async fn conversion_by_user_picks_most_recent_open_referral() {
        let fx = fixture();
        let maria = fx.enroll("maria").await;
        let jon = fx.enroll("jon").await;
        let t0 = Utc::now();
        let user = UserId::new("u1");

        let older = fx.click("maria", t0).await;
        fx.machine.track_signup(&older, &user, t0).await.unwrap();
        let newer = fx.click("jon", t0 + ChronoDuration::hours(1)).await;
        fx.machine
            .track_signup(&newer, &user, t0 + ChronoDuration::hours(1))
            .await
            .unwrap();

        let outcome = fx
            .machine
            .track_conversion(
                &ConversionTarget::User {
                    user_id: user.clone(),
                    affiliate_code: None,
                },
                purchase("pi_1", 10_000),
                t0 + ChronoDuration::days(1),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ConversionOutcome::Converted { ref affiliate_id, commission_minor: 2_000, .. }
                if *affiliate_id == jon
        ));

        // restricting to an affiliate code selects that affiliate's referral
        let outcome = fx
            .machine
            .track_conversion(
                &ConversionTarget::User {
                    user_id: user,
                    affiliate_code: Some("MARIA".to_string()),
                },
                purchase("pi_2", 5_000),
                t0 + ChronoDuration::days(1),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ConversionOutcome::Converted { ref referral_id, .. } if *referral_id == older
        ));
        let maria = fx.registry.get(&maria).await.unwrap();
        assert_eq!(maria.balance.pending_minor, 1_000);
        assert_eq!(maria.stats.converted_referrals, 1);
        assert_eq!(maria.stats.conversion_rate, 100);
    }

    #[tokio::test]
    async fn replayed_payment_event_is_already_attributed() {
        let fx = fixture();
        let affiliate_id = fx.enroll("maria").await;
        let t0 = Utc::now();
        let first = fx.click("maria", t0).await;
        let second = fx.click("maria", t0).await;

        let target = ConversionTarget::Referral {
            referral_id: first.clone(),
        };
        fx.machine
            .track_conversion(&target, purchase("pi_1", 10_000), t0)
            .await
            .unwrap();

        // same payment reference against another open referral
        let replay = fx
            .machine
            .track_conversion(
                &ConversionTarget::Referral {
                    referral_id: second.clone(),
                },
                purchase("pi_1", 10_000),
                t0,
            )
            .await
            .unwrap();
        assert_eq!(
            replay,
            ConversionOutcome::AlreadyAttributed {
                referral_id: first.clone()
            }
        );

        let affiliate = fx.registry.get(&affiliate_id).await.unwrap();
        assert_eq!(affiliate.balance.pending_minor, 2_000);
        assert_eq!(affiliate.balance.lifetime_minor, 2_000);
        let second = fx.storage.get_referral(&second).await.unwrap().unwrap();
        assert_eq!(second.status, ReferralStatus::Clicked);
    }

    #[tokio::test]
    async fn converted_referral_is_never_recalculated() {
        let fx = fixture();
        fx.enroll("maria").await;
        let t0 = Utc::now();
        let referral_id = fx.click("maria", t0).await;
        let target = ConversionTarget::Referral {
            referral_id: referral_id.clone(),
        };

        fx.machine
            .track_conversion(&target, purchase("pi_1", 10_000), t0)
            .await
            .unwrap();
        let outcome = fx
            .machine
            .track_conversion(&target, purchase("pi_2", 99_000), t0)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConversionOutcome::NotApplicable {
                reason: NotApplicable::AlreadyAdvanced
            }
        );

        let referral = fx.storage.get_referral(&referral_id).await.unwrap().unwrap();
        let commission = referral.commission.unwrap();
        assert_eq!(commission.amount_minor, 2_000);
        assert_eq!(commission.status, CommissionStatus::Pending);
    }

    #[tokio::test]
    async fn suspended_affiliate_does_not_convert() {
        let fx = fixture();
        let affiliate_id = fx.enroll("maria").await;
        let t0 = Utc::now();
        let referral_id = fx.click("maria", t0).await;
        fx.registry.suspend(&affiliate_id, t0).await.unwrap();

        let outcome = fx
            .machine
            .track_conversion(
                &ConversionTarget::Referral { referral_id },
                purchase("pi_1", 10_000),
                t0,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConversionOutcome::NotApplicable {
                reason: NotApplicable::AffiliateInactive
            }
        );
    }

    #[tokio::test]
    async fn unknown_targets_are_not_applicable() {
        let fx = fixture();
        let outcome = fx
            .machine
            .track_conversion(
                &ConversionTarget::User {
                    user_id: UserId::new("nobody"),
                    affiliate_code: None,
                },
                purchase("pi_1", 10_000),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConversionOutcome::NotApplicable {
                reason: NotApplicable::NoOpenReferral
            }
        );

        let empty_reference = fx
            .machine
            .track_conversion(
                &ConversionTarget::Referral {
                    referral_id: ReferralId::new("r-1"),
                },
                purchase(" ", 10_000),
                Utc::now(),
            )
            .await;
        assert!(matches!(empty_reference, Err(LedgerError::InvalidInput(_))));
    }
}
