//! Periodic clearing sweep.

use affiliate_ledger::{AffiliateLedger, LedgerError, SweepReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Runs the clearing sweep on an interval and on demand.
pub struct ClearingScheduler {
    ledger: Arc<AffiliateLedger>,
    period: Duration,
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClearingScheduler {
    /// Create a scheduler; pass the receiver to [`ClearingScheduler::start`].
    pub fn new(ledger: Arc<AffiliateLedger>, period: Duration) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            ledger,
            period,
            trigger_tx,
            shutdown_tx,
        });
        (scheduler, trigger_rx)
    }

    /// Request an immediate sweep. Coalesces with pending triggers.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stop the loop; a sweep in progress stops after its current page.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run until [`ClearingScheduler::stop`] is called.
    pub async fn start(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.period.as_secs(), "Clearing scheduler started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once(&shutdown_rx).await;
                }
                Some(_) = trigger_rx.recv() => {
                    self.sweep_once(&shutdown_rx).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Clearing scheduler stopped");
    }

    async fn sweep_once(&self, cancel: &watch::Receiver<bool>) -> Option<SweepReport> {
        match self
            .ledger
            .process_cleared_commissions_at(Utc::now(), Some(cancel))
            .await
        {
            Ok(report) => Some(report),
            Err(LedgerError::SweepAlreadyRunning) => {
                tracing::debug!("Sweep already running, tick skipped");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Clearing sweep failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affiliate_ledger::{ConversionTarget, ClickOutcome, EnrollAffiliate, LedgerConfig};
    use affiliate_storage::memory::InMemoryAffiliateStorage;
    use affiliate_types::{Purchase, PurchaseCategory, TrackingContext};

    #[tokio::test]
    async fn triggered_sweep_clears_due_commissions_and_stops() {
        let mut config = LedgerConfig::default();
        config.commission.hold_days = 0;
        let ledger = Arc::new(AffiliateLedger::with_config(
            Arc::new(InMemoryAffiliateStorage::new()),
            config,
        ));
        let affiliate = ledger
            .enroll(EnrollAffiliate {
                code: "maria".to_string(),
                display_name: "Maria".to_string(),
                ..EnrollAffiliate::default()
            })
            .await
            .unwrap();
        let ClickOutcome::Attributed { referral_id, .. } = ledger
            .track_click("maria", TrackingContext::default())
            .await
            .unwrap()
        else {
            panic!("click was not attributed");
        };
        ledger
            .track_conversion(
                &ConversionTarget::Referral { referral_id },
                Purchase {
                    category: PurchaseCategory::Courses,
                    reference_id: "pi_1".to_string(),
                    amount_minor: 10_000,
                },
            )
            .await
            .unwrap();

        let (scheduler, trigger_rx) =
            ClearingScheduler::new(Arc::clone(&ledger), Duration::from_secs(3_600));
        let handle = tokio::spawn(Arc::clone(&scheduler).start(trigger_rx));
        scheduler.trigger();

        let mut available = 0;
        for _ in 0..50 {
            available = ledger
                .get_affiliate(&affiliate.affiliate_id)
                .await
                .unwrap()
                .balance
                .available_minor;
            if available > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(available, 2_000);

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.is_stopped());
    }
}
