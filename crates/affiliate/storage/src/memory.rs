//! In-memory reference implementation for the affiliate storage traits.
//!
//! This adapter is deterministic and test-friendly. All collections sit behind
//! one lock so the multi-document commits are atomic; production deployments
//! should use the PostgreSQL adapter.

use crate::model::{
    ClearingCommit, ClearingCommitted, ClickCommitted, ConversionCommit, ConversionCommitted,
    PayoutCommit, PayoutCommitted,
};
use crate::traits::{
    AffiliateStore, LedgerCommitStore, PageRequest, PayoutStore, QueryWindow, ReferralStore,
};
use crate::{StorageError, StorageResult};
use affiliate_types::{
    normalize_code, Affiliate, AffiliateId, AffiliateStatus, CommissionStatus, CustomLink, Payout,
    PayoutId, PayoutPolicy, Referral, ReferralId, ReferralStatus, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Collections {
    affiliates: HashMap<AffiliateId, Affiliate>,
    codes: HashMap<String, AffiliateId>,
    referrals: BTreeMap<ReferralId, Referral>,
    payment_references: HashMap<String, ReferralId>,
    payouts: HashMap<PayoutId, Payout>,
}

/// In-memory affiliate storage adapter.
#[derive(Default)]
pub struct InMemoryAffiliateStorage {
    collections: RwLock<Collections>,
}

impl InMemoryAffiliateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| StorageError::Backend("affiliate storage lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| StorageError::Backend("affiliate storage lock poisoned".to_string()))
    }
}

fn affiliate_not_found(affiliate_id: &AffiliateId) -> StorageError {
    StorageError::NotFound(format!("affiliate {} not found", affiliate_id))
}

fn referral_not_found(referral_id: &ReferralId) -> StorageError {
    StorageError::NotFound(format!("referral {} not found", referral_id))
}

#[async_trait]
impl AffiliateStore for InMemoryAffiliateStorage {
    async fn create_affiliate(&self, mut affiliate: Affiliate) -> StorageResult<()> {
        let mut guard = self.write()?;
        affiliate.code = normalize_code(&affiliate.code);

        if guard.affiliates.contains_key(&affiliate.affiliate_id) {
            return Err(StorageError::Conflict(format!(
                "affiliate {} already exists",
                affiliate.affiliate_id
            )));
        }
        if guard.codes.contains_key(&affiliate.code) {
            return Err(StorageError::Conflict(format!(
                "affiliate code '{}' already taken",
                affiliate.code
            )));
        }

        guard
            .codes
            .insert(affiliate.code.clone(), affiliate.affiliate_id.clone());
        guard
            .affiliates
            .insert(affiliate.affiliate_id.clone(), affiliate);
        Ok(())
    }

    async fn get_affiliate(&self, affiliate_id: &AffiliateId) -> StorageResult<Option<Affiliate>> {
        let guard = self.read()?;
        Ok(guard.affiliates.get(affiliate_id).cloned())
    }

    async fn find_affiliate_by_code(&self, code: &str) -> StorageResult<Option<Affiliate>> {
        let guard = self.read()?;
        Ok(guard
            .codes
            .get(&normalize_code(code))
            .and_then(|id| guard.affiliates.get(id))
            .cloned())
    }

    async fn set_affiliate_status(
        &self,
        affiliate_id: &AffiliateId,
        status: AffiliateStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self.write()?;
        let affiliate = guard
            .affiliates
            .get_mut(affiliate_id)
            .ok_or_else(|| affiliate_not_found(affiliate_id))?;
        affiliate.status = status;
        affiliate.updated_at = updated_at;
        Ok(())
    }

    async fn set_payout_policy(
        &self,
        affiliate_id: &AffiliateId,
        policy: PayoutPolicy,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self.write()?;
        let affiliate = guard
            .affiliates
            .get_mut(affiliate_id)
            .ok_or_else(|| affiliate_not_found(affiliate_id))?;
        affiliate.payout = policy;
        affiliate.updated_at = updated_at;
        Ok(())
    }

    async fn add_custom_link(
        &self,
        affiliate_id: &AffiliateId,
        link: CustomLink,
    ) -> StorageResult<()> {
        let mut guard = self.write()?;
        let affiliate = guard
            .affiliates
            .get_mut(affiliate_id)
            .ok_or_else(|| affiliate_not_found(affiliate_id))?;
        if affiliate.link(&link.slug).is_some() {
            return Err(StorageError::Conflict(format!(
                "link '{}' already exists for affiliate {}",
                link.slug, affiliate_id
            )));
        }
        affiliate.updated_at = link.created_at;
        affiliate.custom_links.push(link);
        Ok(())
    }

    async fn list_affiliates(&self, window: QueryWindow) -> StorageResult<Vec<Affiliate>> {
        let guard = self.read()?;
        let mut values = guard.affiliates.values().cloned().collect::<Vec<_>>();
        values.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.affiliate_id.cmp(&b.affiliate_id))
        });
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl ReferralStore for InMemoryAffiliateStorage {
    async fn get_referral(&self, referral_id: &ReferralId) -> StorageResult<Option<Referral>> {
        let guard = self.read()?;
        Ok(guard.referrals.get(referral_id).cloned())
    }

    async fn find_open_referral_for_user(
        &self,
        user_id: &UserId,
        affiliate_id: Option<&AffiliateId>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Referral>> {
        let guard = self.read()?;
        Ok(guard
            .referrals
            .values()
            .filter(|referral| referral.referred_user_id.as_ref() == Some(user_id))
            .filter(|referral| affiliate_id.map_or(true, |id| &referral.affiliate_id == id))
            .filter(|referral| referral.is_open_at(now))
            .max_by_key(|referral| referral.clicked_at)
            .cloned())
    }

    async fn find_referral_by_payment_reference(
        &self,
        reference_id: &str,
    ) -> StorageResult<Option<Referral>> {
        let guard = self.read()?;
        Ok(guard
            .payment_references
            .get(reference_id)
            .and_then(|id| guard.referrals.get(id))
            .cloned())
    }

    async fn list_due_commissions(
        &self,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Referral>> {
        let guard = self.read()?;
        let lower = match page.after.as_ref() {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        let due = guard
            .referrals
            .range::<ReferralId, _>((lower, Bound::Unbounded))
            .map(|(_, referral)| referral)
            .filter(|referral| {
                referral
                    .commission
                    .as_ref()
                    .is_some_and(|commission| commission.is_due_at(now))
            })
            .cloned();
        Ok(if page.limit == 0 {
            due.collect()
        } else {
            due.take(page.limit).collect()
        })
    }

    async fn list_referrals_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        commission_status: Option<CommissionStatus>,
    ) -> StorageResult<Vec<Referral>> {
        let guard = self.read()?;
        let mut values = guard
            .referrals
            .values()
            .filter(|referral| &referral.affiliate_id == affiliate_id)
            .filter(|referral| {
                commission_status.map_or(true, |status| {
                    referral.commission_status() == Some(status)
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.clicked_at.cmp(&b.clicked_at));
        Ok(values)
    }
}

#[async_trait]
impl PayoutStore for InMemoryAffiliateStorage {
    async fn get_payout(&self, payout_id: &PayoutId) -> StorageResult<Option<Payout>> {
        let guard = self.read()?;
        Ok(guard.payouts.get(payout_id).cloned())
    }

    async fn list_payouts_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Payout>> {
        let guard = self.read()?;
        let mut values = guard
            .payouts
            .values()
            .filter(|payout| &payout.affiliate_id == affiliate_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl LedgerCommitStore for InMemoryAffiliateStorage {
    async fn commit_click(&self, referral: Referral) -> StorageResult<ClickCommitted> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        if state.referrals.contains_key(&referral.referral_id) {
            return Err(StorageError::Conflict(format!(
                "referral {} already exists",
                referral.referral_id
            )));
        }
        let affiliate = state
            .affiliates
            .get_mut(&referral.affiliate_id)
            .ok_or_else(|| affiliate_not_found(&referral.affiliate_id))?;

        affiliate.stats.record_click(referral.clicked_at);
        affiliate.updated_at = referral.clicked_at;
        let link_matched = match referral.tracking.link_slug.as_deref() {
            Some(slug) => match affiliate.link_mut(slug) {
                Some(link) => {
                    link.clicks = link.clicks.saturating_add(1);
                    true
                }
                None => false,
            },
            None => false,
        };
        let stats = affiliate.stats.clone();

        state
            .referrals
            .insert(referral.referral_id.clone(), referral);
        Ok(ClickCommitted {
            stats,
            link_matched,
        })
    }

    async fn commit_signup(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StorageResult<Referral> {
        let mut guard = self.write()?;
        let referral = guard
            .referrals
            .get_mut(referral_id)
            .ok_or_else(|| referral_not_found(referral_id))?;

        if referral.status != ReferralStatus::Clicked || !referral.cookie_valid_at(at) {
            return Err(StorageError::PreconditionFailed(format!(
                "referral {} cannot sign up from status {} (cookie expires {})",
                referral_id, referral.status, referral.cookie_expires_at
            )));
        }

        referral.status = ReferralStatus::SignedUp;
        referral.referred_user_id = Some(user_id.clone());
        referral.signed_up_at = Some(at);
        referral.updated_at = at;
        Ok(referral.clone())
    }

    async fn commit_conversion(
        &self,
        commit: ConversionCommit,
    ) -> StorageResult<ConversionCommitted> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let referral = state
            .referrals
            .get_mut(&commit.referral_id)
            .ok_or_else(|| referral_not_found(&commit.referral_id))?;
        if referral.status != commit.expected_from
            || !referral.status.can_advance_to(ReferralStatus::Converted)
            || !referral.cookie_valid_at(commit.converted_at)
        {
            return Err(StorageError::PreconditionFailed(format!(
                "referral {} cannot convert from status {} (expected {})",
                commit.referral_id, referral.status, commit.expected_from
            )));
        }
        if state
            .payment_references
            .contains_key(&commit.purchase.reference_id)
        {
            return Err(StorageError::DuplicatePaymentReference(
                commit.purchase.reference_id.clone(),
            ));
        }
        let affiliate = state
            .affiliates
            .get_mut(&referral.affiliate_id)
            .ok_or_else(|| affiliate_not_found(&referral.affiliate_id))?;

        let applied = affiliate.balance.apply(commit.movement);
        affiliate.balance = applied.balance;
        affiliate.stats.record_conversion(commit.purchase.amount_minor);
        affiliate.updated_at = commit.converted_at;
        let stats = affiliate.stats.clone();

        state.payment_references.insert(
            commit.purchase.reference_id.clone(),
            commit.referral_id.clone(),
        );
        referral.status = ReferralStatus::Converted;
        referral.purchase = Some(commit.purchase);
        referral.commission = Some(commit.commission);
        referral.converted_at = Some(commit.converted_at);
        referral.updated_at = commit.converted_at;

        Ok(ConversionCommitted {
            referral: referral.clone(),
            balance: applied,
            stats,
        })
    }

    async fn commit_clearing(&self, commit: ClearingCommit) -> StorageResult<ClearingCommitted> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let referral = state
            .referrals
            .get_mut(&commit.referral_id)
            .ok_or_else(|| referral_not_found(&commit.referral_id))?;
        let Some(commission) = referral.commission.as_mut() else {
            return Err(StorageError::PreconditionFailed(format!(
                "referral {} has no commission",
                commit.referral_id
            )));
        };
        if !commission.is_due_at(commit.cleared_at) {
            return Err(StorageError::PreconditionFailed(format!(
                "commission on referral {} is {} and clears at {}",
                commit.referral_id, commission.status, commission.clears_at
            )));
        }
        let affiliate = state
            .affiliates
            .get_mut(&referral.affiliate_id)
            .ok_or_else(|| affiliate_not_found(&referral.affiliate_id))?;

        let applied = affiliate.balance.apply(commit.movement);
        affiliate.balance = applied.balance;
        affiliate.updated_at = commit.cleared_at;

        commission.status = CommissionStatus::Cleared;
        commission.cleared_at = Some(commit.cleared_at);
        referral.updated_at = commit.cleared_at;

        Ok(ClearingCommitted {
            referral: referral.clone(),
            balance: applied,
        })
    }

    async fn commit_payout(&self, commit: PayoutCommit) -> StorageResult<PayoutCommitted> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let payout = commit.payout;

        if state.payouts.contains_key(&payout.payout_id) {
            return Err(StorageError::Conflict(format!(
                "payout {} already exists",
                payout.payout_id
            )));
        }
        for referral_id in &payout.referral_ids {
            let referral = state
                .referrals
                .get(referral_id)
                .ok_or_else(|| referral_not_found(referral_id))?;
            let settles = referral.affiliate_id == payout.affiliate_id
                && referral.status.can_advance_to(ReferralStatus::Paid)
                && referral.commission_status() == Some(CommissionStatus::Cleared);
            if !settles {
                return Err(StorageError::PreconditionFailed(format!(
                    "referral {} is not a cleared commission of affiliate {}",
                    referral_id, payout.affiliate_id
                )));
            }
        }
        let affiliate = state
            .affiliates
            .get_mut(&payout.affiliate_id)
            .ok_or_else(|| affiliate_not_found(&payout.affiliate_id))?;

        let applied = affiliate.balance.apply(commit.movement);
        affiliate.balance = applied.balance;
        affiliate.updated_at = payout.created_at;

        for referral_id in &payout.referral_ids {
            if let Some(referral) = state.referrals.get_mut(referral_id) {
                referral.status = ReferralStatus::Paid;
                referral.updated_at = payout.created_at;
                if let Some(commission) = referral.commission.as_mut() {
                    commission.status = CommissionStatus::Paid;
                    commission.paid_at = Some(payout.created_at);
                    commission.payout_id = Some(payout.payout_id.clone());
                }
            }
        }
        state
            .payouts
            .insert(payout.payout_id.clone(), payout.clone());

        Ok(PayoutCommitted {
            payout,
            balance: applied,
        })
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
