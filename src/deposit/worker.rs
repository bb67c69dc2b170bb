//! Deposit Sweep Worker
//!
//! Periodically expires stale PENDING intents (never deleting them) and
//! retries held unmatched transfers.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::reconciler::DepositReconciler;
use super::store::DepositStore;
use super::types::DepositError;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub unmatched_reported: usize,
}

pub struct DepositSweeper {
    store: Arc<dyn DepositStore>,
    reconciler: Arc<DepositReconciler>,
    config: SweepConfig,
}

impl DepositSweeper {
    pub fn new(
        store: Arc<dyn DepositStore>,
        reconciler: Arc<DepositReconciler>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            config,
        }
    }

    /// Run until `shutdown` flips to true. The in-progress sweep always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting deposit sweep worker"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, code = e.code(), "Deposit sweep failed");
            }
        }
        info!("Deposit sweep worker stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, DepositError> {
        let now = Utc::now();
        let expired = self.store.expire_stale_intents(now).await?;
        for id in &expired {
            warn!(intent_id = %id, "Deposit intent expired, left for manual recovery");
        }

        let unmatched_reported = self.reconciler.retry_unmatched(now).await?;

        let report = SweepReport {
            expired: expired.len(),
            unmatched_reported,
        };
        if report == SweepReport::default() {
            debug!("Deposit sweep: nothing to do");
        } else {
            info!(expired = report.expired, unmatched = report.unmatched_reported, "Deposit sweep done");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit::reconciler::ReconcilerConfig;
    use crate::deposit::types::{DepositIntent, IntentStatus, NewDepositIntent, ProductKind};
    use crate::events::TracingNotifier;
    use crate::money::MoneyAmount;
    use crate::persistence::MemoryStore;

    #[tokio::test]
    async fn test_sweep_expires_stale_intents_without_deleting() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(DepositReconciler::new(
            store.clone(),
            Arc::new(TracingNotifier),
            ReconcilerConfig::default(),
        ));
        let sweeper = DepositSweeper::new(store.clone(), reconciler, SweepConfig::default());

        let now = Utc::now();
        let make = |created| {
            DepositIntent::new(
                NewDepositIntent {
                    owner: "alice".into(),
                    expected_amount: MoneyAmount::from_whole(10),
                    receiving_address: "0x1111111111111111111111111111111111111111".into(),
                    tolerance_bps: None,
                    product: ProductKind::Flexible,
                },
                200,
                chrono::Duration::hours(24),
                created,
            )
        };
        let stale = make(now - chrono::Duration::hours(25));
        let fresh = make(now - chrono::Duration::hours(1));
        store.insert_intent(&stale).await.unwrap();
        store.insert_intent(&fresh).await.unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);

        let stale_after = store.get_intent(stale.id).await.unwrap().unwrap();
        assert_eq!(stale_after.status, IntentStatus::Expired);
        let fresh_after = store.get_intent(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh_after.status, IntentStatus::Pending);

        assert_eq!(sweeper.sweep_once().await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(DepositReconciler::new(
            store.clone(),
            Arc::new(TracingNotifier),
            ReconcilerConfig::default(),
        ));
        let sweeper = Arc::new(DepositSweeper::new(
            store,
            reconciler,
            SweepConfig {
                interval: Duration::from_millis(10),
            },
        ));
        let (tx, rx) = watch::channel(false);
        let task = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
