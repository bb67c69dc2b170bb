//! Deposit Reconciler
//!
//! Matches confirmed transfers to PENDING intents and performs the
//! exactly-once confirmation. Unmatched transfers never change state; they are
//! retried until the grace window passes and then reported for manual review.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::DepositStore;
use super::types::{
    Confirmation, DEFAULT_ROI_CAP_MULTIPLE, DepositError, DepositIntent, IntentStatus,
    ReconcileOutcome,
};
use crate::chain::types::same_address;
use crate::chain::{ChainTransferEvent, TransferKey};
use crate::events::{SettlementEvent, SettlementNotifier};
use crate::money::MoneyAmount;
use crate::monitor::{MonitorError, TransferSink};
use crate::persistence::StoreError;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub roi_cap_multiple: i64,
    /// How long an unmatched transfer keeps being retried before it is reported
    pub grace_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            roi_cap_multiple: DEFAULT_ROI_CAP_MULTIPLE,
            grace_window: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
struct UnmatchedEntry {
    event: ChainTransferEvent,
    first_seen: DateTime<Utc>,
    reason: String,
}

/// Pick the intent a transfer settles.
///
/// Candidates must be PENDING, on the transfer's address and within their own
/// tolerance. Exact amounts win, then the earliest `created_at`.
pub fn select_match<'a>(
    candidates: impl IntoIterator<Item = &'a DepositIntent>,
    event: &ChainTransferEvent,
) -> Option<&'a DepositIntent> {
    candidates
        .into_iter()
        .filter(|intent| intent.status == IntentStatus::Pending)
        .filter(|intent| same_address(&intent.receiving_address, &event.to_address))
        .filter_map(|intent| {
            let check =
                MoneyAmount::tolerance_check(&intent.expected_amount, &event.amount, intent.tolerance_bps);
            check
                .matches
                .then_some((check.signed_difference.is_zero(), intent))
        })
        .min_by(|(a_exact, a), (b_exact, b)| {
            b_exact
                .cmp(a_exact)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
        .map(|(_, intent)| intent)
}

pub struct DepositReconciler {
    store: Arc<dyn DepositStore>,
    notifier: Arc<dyn SettlementNotifier>,
    config: ReconcilerConfig,
    unmatched: Mutex<HashMap<TransferKey, UnmatchedEntry>>,
}

impl DepositReconciler {
    pub fn new(
        store: Arc<dyn DepositStore>,
        notifier: Arc<dyn SettlementNotifier>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            unmatched: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile one confirmed transfer. Redelivery of the same
    /// `(tx_hash, log_index)` is a no-op returning [`ReconcileOutcome::Duplicate`].
    pub async fn reconcile(
        &self,
        event: &ChainTransferEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, DepositError> {
        let key = event.key();
        if self.store.is_transfer_processed(&key).await? {
            debug!(key = %key, "Transfer already processed");
            self.unmatched.lock().await.remove(&key);
            return Ok(ReconcileOutcome::Duplicate);
        }

        let outcome = self.try_match(event, now).await?;
        match &outcome {
            ReconcileOutcome::Confirmed { .. } | ReconcileOutcome::Duplicate => {
                self.unmatched.lock().await.remove(&key);
            }
            ReconcileOutcome::Unmatched { reason } => {
                let mut unmatched = self.unmatched.lock().await;
                let entry = unmatched.entry(key.clone()).or_insert_with(|| UnmatchedEntry {
                    event: event.clone(),
                    first_seen: now,
                    reason: reason.clone(),
                });
                entry.reason = reason.clone();
                info!(
                    key = %key,
                    amount = %event.amount,
                    reason,
                    first_seen = %entry.first_seen,
                    "No matching deposit intent, holding for grace window"
                );
            }
        }
        Ok(outcome)
    }

    async fn try_match(
        &self,
        event: &ChainTransferEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, DepositError> {
        let candidates = self.store.pending_intents_for(&event.to_address, now).await?;
        if candidates.is_empty() {
            return Ok(ReconcileOutcome::Unmatched {
                reason: "no pending intent for address".to_string(),
            });
        }

        let mut excluded: HashSet<Uuid> = HashSet::new();
        loop {
            let intent = match select_match(
                candidates.iter().filter(|i| !excluded.contains(&i.id)),
                event,
            ) {
                Some(intent) => intent,
                None => {
                    return Ok(ReconcileOutcome::Unmatched {
                        reason: format!(
                            "amount {} outside tolerance of {} pending intent(s)",
                            event.amount,
                            candidates.len()
                        ),
                    });
                }
            };

            let confirmation = Confirmation {
                intent_id: intent.id,
                tx_hash: event.tx_hash.to_lowercase(),
                log_index: event.log_index,
                block_number: event.block_number,
                from_address: event.from_address.clone(),
                actual_amount: event.amount.clone(),
                roi_cap_multiple: self.config.roi_cap_multiple,
                confirmed_at: now,
            };

            match self.store.commit_confirmation(&confirmation).await {
                Ok(confirmed) => {
                    info!(
                        intent_id = %confirmed.id,
                        owner = %confirmed.owner,
                        expected = %confirmed.expected_amount,
                        actual = %event.amount,
                        tx_hash = %event.tx_hash,
                        block = event.block_number,
                        "Deposit confirmed"
                    );
                    self.notifier.publish(SettlementEvent::DepositConfirmed {
                        intent_id: confirmed.id,
                        owner: confirmed.owner.clone(),
                        actual_amount: event.amount.clone(),
                        tx_hash: event.tx_hash.clone(),
                        block_number: event.block_number,
                    });
                    return Ok(ReconcileOutcome::Confirmed {
                        intent_id: confirmed.id,
                        owner: confirmed.owner,
                        actual_amount: event.amount.clone(),
                    });
                }
                Err(StoreError::Duplicate(_)) => return Ok(ReconcileOutcome::Duplicate),
                Err(StoreError::Conflict(msg)) => {
                    // lost the row to a concurrent confirmation or expiry
                    debug!(intent_id = %intent.id, msg, "Intent no longer pending, trying next");
                    excluded.insert(intent.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Retry held transfers; report those past the grace window.
    pub async fn retry_unmatched(&self, now: DateTime<Utc>) -> Result<usize, DepositError> {
        let held: Vec<UnmatchedEntry> = self.unmatched.lock().await.values().cloned().collect();
        let mut reported = 0;

        for entry in held {
            let key = entry.event.key();
            match self.reconcile(&entry.event, now).await? {
                ReconcileOutcome::Unmatched { reason } => {
                    if now - entry.first_seen >= self.config.grace_window {
                        self.unmatched.lock().await.remove(&key);
                        warn!(
                            key = %key,
                            amount = %entry.event.amount,
                            to = %entry.event.to_address,
                            reason,
                            "Unmatched deposit transfer reported for manual review"
                        );
                        self.notifier.publish(SettlementEvent::UnmatchedTransfer {
                            tx_hash: entry.event.tx_hash.clone(),
                            log_index: entry.event.log_index,
                            to_address: entry.event.to_address.clone(),
                            amount: entry.event.amount.clone(),
                            block_number: entry.event.block_number,
                        });
                        reported += 1;
                    }
                }
                ReconcileOutcome::Confirmed { .. } | ReconcileOutcome::Duplicate => {}
            }
        }
        Ok(reported)
    }

    pub async fn unmatched_count(&self) -> usize {
        self.unmatched.lock().await.len()
    }
}

#[async_trait]
impl TransferSink for DepositReconciler {
    async fn on_confirmed_transfer(&self, event: ChainTransferEvent) -> Result<(), MonitorError> {
        self.reconcile(&event, Utc::now())
            .await
            .map(|_| ())
            .map_err(|e| MonitorError::Sink(format!("{}: {}", e.code(), e)))
    }
}
