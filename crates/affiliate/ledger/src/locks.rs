//! Per-affiliate writer locks.
//!
//! Every operation that moves an affiliate's balance holds that affiliate's
//! lock, so there is a single writer per balance inside one process. The store
//! commits are atomic on their own; the lock additionally makes the payout
//! snapshot (available balance + cleared referrals) consistent.

use crate::LedgerError;
use affiliate_types::AffiliateId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async mutex registry.
#[derive(Default)]
pub struct AffiliateLocks {
    slots: Mutex<HashMap<AffiliateId, Arc<AsyncMutex<()>>>>,
}

/// Held writer lock for one affiliate.
pub type AffiliateGuard = OwnedMutexGuard<()>;

impl AffiliateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, affiliate_id: &AffiliateId) -> Arc<AsyncMutex<()>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // drop idle slots so the map tracks only contended affiliates
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        Arc::clone(slots.entry(affiliate_id.clone()).or_default())
    }

    /// Wait for the affiliate's lock.
    pub async fn lock(&self, affiliate_id: &AffiliateId) -> AffiliateGuard {
        self.slot(affiliate_id).lock_owned().await
    }

    /// Wait at most `timeout` for the affiliate's lock.
    pub async fn lock_within(
        &self,
        affiliate_id: &AffiliateId,
        timeout: Duration,
    ) -> Result<AffiliateGuard, LedgerError> {
        tokio::time::timeout(timeout, self.lock(affiliate_id))
            .await
            .map_err(|_| LedgerError::LockTimeout(affiliate_id.clone()))
    }

    /// Number of affiliates with a live slot.
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_writer_times_out_while_first_holds_lock() {
        let locks = AffiliateLocks::new();
        let id = AffiliateId::new("aff-1");

        let _guard = locks.lock(&id).await;
        let result = locks.lock_within(&id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(LedgerError::LockTimeout(_))));
    }

    #[tokio::test]
    async fn different_affiliates_do_not_contend() {
        let locks = AffiliateLocks::new();
        let _a = locks.lock(&AffiliateId::new("aff-a")).await;
        let b = locks
            .lock_within(&AffiliateId::new("aff-b"), Duration::from_millis(20))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = AffiliateLocks::new();
        {
            let _guard = locks.lock(&AffiliateId::new("aff-1")).await;
            assert_eq!(locks.tracked(), 1);
        }
        let _other = locks.lock(&AffiliateId::new("aff-2")).await;
        assert_eq!(locks.tracked(), 1);
    }
}
