//! Payment Retry Engine
//!
//! Owns every PayoutRequest/RetryRecord pair from enqueue until it is resolved
//! or parked in the dead letter queue. Work is picked up by a periodic sweep
//! over records whose `next_retry_at` has elapsed; there are no per-record timers.
//!
//! # Attempt flow
//! ```text
//! claim (lease) -> last_tx_hash known on chain? -> resolve
//!               -> prepare (sign) -> persist tx hash -> broadcast -> resolve
//!                                                                -> record_failure
//! ```
//! The signed hash is stored before broadcast, so a lost node response is
//! recovered by the next attempt instead of producing a second transfer.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::PaymentDispatcher;
use super::error::{FailureKind, PaymentFailure, PayoutError};
use super::store::{AuditEntry, PayoutStore};
use super::types::{
    EarningRecord, FailureDisposition, PayoutRequest, PayoutStatus, RetryPolicy, RetryRecord,
    batch_earnings,
};
use crate::chain::ChainAccess;
use crate::events::{AlertSeverity, SettlementEvent, SettlementNotifier};
use crate::money::MoneyAmount;
use crate::persistence::StoreError;

#[derive(Debug, Clone)]
pub struct RetryEngineConfig {
    pub policy: RetryPolicy,
    pub sweep_interval: Duration,
    /// How long a claimed record is hidden from other sweeps
    pub lease: chrono::Duration,
    pub batch_size: usize,
    /// Blocks a SENT payout's receipt needs before it is CONFIRMED
    pub confirmation_depth: u64,
}

impl Default for RetryEngineConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(15),
            lease: chrono::Duration::minutes(5),
            batch_size: 50,
            confirmation_depth: 12,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub claimed: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Resolved from a previously persisted transaction, without a new broadcast
    pub recovered: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpSummary {
    pub confirmed: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Result of looking up a previously broadcast transaction
enum PriorTx {
    Landed(String),
    Reverted(String),
    Absent,
}

enum AttemptOutcome {
    Resolved { recovered: bool },
    Failed(FailureDisposition),
    Skipped,
}

pub struct RetryEngine {
    store: Arc<dyn PayoutStore>,
    dispatcher: Arc<PaymentDispatcher>,
    access: Arc<ChainAccess>,
    notifier: Arc<dyn SettlementNotifier>,
    config: RetryEngineConfig,
    accepting: AtomicBool,
}

impl RetryEngine {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        dispatcher: Arc<PaymentDispatcher>,
        access: Arc<ChainAccess>,
        notifier: Arc<dyn SettlementNotifier>,
        config: RetryEngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            access,
            notifier,
            config,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &RetryEngineConfig {
        &self.config
    }

    /// Stop accepting new payouts. Sweeps keep working existing records.
    pub fn close(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Retry engine closed for new payouts");
        }
    }

    fn ensure_accepting(&self) -> Result<(), PayoutError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PayoutError::ShuttingDown)
        }
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Create a QUEUED payout and its retry record, due immediately.
    pub async fn enqueue_payout(
        &self,
        destination: &str,
        amount: MoneyAmount,
        source_refs: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, PayoutError> {
        self.ensure_accepting()?;
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(PayoutError::InvalidRequest("destination is empty".into()));
        }
        if !amount.is_positive() {
            return Err(PayoutError::InvalidRequest(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        let request = PayoutRequest {
            id: Uuid::new_v4(),
            destination: destination.to_lowercase(),
            amount,
            source_refs,
            status: PayoutStatus::Queued,
            created_at: now,
        };
        let record = RetryRecord::new(request.id, self.config.policy.max_attempts, now);
        self.store.create_payout(&request, &record).await?;

        info!(
            payout_id = %request.id,
            destination = %request.destination,
            amount = %request.amount,
            earnings = request.source_refs.len(),
            "Payout queued"
        );
        Ok(request)
    }

    /// Record accrued earnings and queue one payout per destination.
    pub async fn enqueue_earnings(
        &self,
        earnings: &[EarningRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<PayoutRequest>, PayoutError> {
        self.ensure_accepting()?;
        if earnings.is_empty() {
            return Ok(Vec::new());
        }
        self.store.insert_earnings(earnings).await?;

        let mut queued = Vec::new();
        for batch in batch_earnings(earnings) {
            let request = self
                .enqueue_payout(&batch.destination, batch.amount, batch.earning_ids, now)
                .await?;
            queued.push(request);
        }
        Ok(queued)
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Attempt every due record once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, PayoutError> {
        let claimed = self
            .store
            .claim_due(now, self.config.lease, self.config.batch_size)
            .await?;

        let mut summary = SweepSummary {
            claimed: claimed.len(),
            ..SweepSummary::default()
        };
        if claimed.is_empty() {
            debug!("Retry sweep: nothing due");
            return Ok(summary);
        }

        for record in &claimed {
            match self.attempt(record, now).await {
                AttemptOutcome::Resolved { recovered } => {
                    summary.resolved += 1;
                    if recovered {
                        summary.recovered += 1;
                    }
                }
                AttemptOutcome::Failed(FailureDisposition::Scheduled { .. }) => {
                    summary.rescheduled += 1
                }
                AttemptOutcome::Failed(FailureDisposition::DeadLettered) => {
                    summary.dead_lettered += 1
                }
                AttemptOutcome::Skipped => {}
            }
        }

        info!(
            claimed = summary.claimed,
            resolved = summary.resolved,
            rescheduled = summary.rescheduled,
            dead_lettered = summary.dead_lettered,
            "Retry sweep done"
        );
        Ok(summary)
    }

    async fn attempt(&self, record: &RetryRecord, now: DateTime<Utc>) -> AttemptOutcome {
        let id = record.payout_request_id;
        let payout = match self.store.get_payout(id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                error!(payout_id = %id, "Retry record without payout request");
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                error!(payout_id = %id, error = %e, "Failed to load payout");
                return AttemptOutcome::Skipped;
            }
        };

        debug!(
            payout_id = %id,
            state = %record.state,
            attempt = record.attempt_count + 1,
            "Attempting payout"
        );

        if let Some(prior) = &record.last_tx_hash {
            match self.check_prior_tx(prior).await {
                Ok(PriorTx::Landed(hash)) => {
                    info!(payout_id = %id, tx_hash = %hash, "Previous broadcast found on chain");
                    return self.resolve(id, &hash, now, true).await;
                }
                Ok(PriorTx::Reverted(hash)) => {
                    let failure = PaymentFailure::new(
                        FailureKind::Reverted,
                        format!("transaction {} reverted", hash),
                    );
                    return self.fail(id, &failure, now).await;
                }
                Ok(PriorTx::Absent) => {
                    debug!(payout_id = %id, tx_hash = %prior, "Previous broadcast not found, re-sending");
                }
                Err(failure) => return self.fail(id, &failure, now).await,
            }
        }

        let prepared = match self.dispatcher.prepare(&payout).await {
            Ok(p) => p,
            Err(failure) => return self.fail(id, &failure, now).await,
        };

        if let Err(e) = self.store.record_attempt_tx(id, &prepared.tx.tx_hash).await {
            // nothing was broadcast; the lease expires and the record is retried
            error!(payout_id = %id, error = %e, "Failed to persist signed transaction");
            self.dispatcher.invalidate_nonce().await;
            return AttemptOutcome::Skipped;
        }

        match self.dispatcher.broadcast(&prepared).await {
            Ok(hash) => self.resolve(id, &hash, now, false).await,
            Err(failure) => self.fail(id, &failure, now).await,
        }
    }

    async fn check_prior_tx(&self, tx_hash: &str) -> Result<PriorTx, PaymentFailure> {
        if let Some(receipt) = self.access.transaction_receipt(tx_hash).await? {
            return Ok(if receipt.success {
                PriorTx::Landed(receipt.tx_hash)
            } else {
                PriorTx::Reverted(receipt.tx_hash)
            });
        }
        if self.access.transaction_known(tx_hash).await? {
            return Ok(PriorTx::Landed(tx_hash.to_lowercase()));
        }
        Ok(PriorTx::Absent)
    }

    async fn resolve(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
        recovered: bool,
    ) -> AttemptOutcome {
        match self.store.resolve_payout(id, tx_hash, now).await {
            Ok(record) => {
                info!(
                    payout_id = %id,
                    tx_hash = %tx_hash,
                    attempts = record.attempt_count + 1,
                    "Payout resolved"
                );
                self.notifier.publish(SettlementEvent::PayoutResolved {
                    payout_id: id,
                    tx_hash: tx_hash.to_lowercase(),
                });
                AttemptOutcome::Resolved { recovered }
            }
            Err(e) => {
                // the tx hash is persisted; the next attempt finds it on chain
                error!(payout_id = %id, tx_hash = %tx_hash, error = %e, "Failed to record resolution");
                AttemptOutcome::Skipped
            }
        }
    }

    async fn fail(&self, id: Uuid, failure: &PaymentFailure, now: DateTime<Utc>) -> AttemptOutcome {
        match self
            .store
            .record_failure(id, failure, &self.config.policy, now)
            .await
        {
            Ok((record, FailureDisposition::Scheduled { next_retry_at })) => {
                warn!(
                    payout_id = %id,
                    attempt = record.attempt_count,
                    kind = failure.kind.as_str(),
                    error = %failure.message,
                    next_retry_at = %next_retry_at,
                    "Payout attempt failed, retry scheduled"
                );
                AttemptOutcome::Failed(FailureDisposition::Scheduled { next_retry_at })
            }
            Ok((record, FailureDisposition::DeadLettered)) => {
                let last_error = record.last_error.clone().unwrap_or_default();
                error!(
                    payout_id = %id,
                    attempts = record.attempt_count,
                    error = %last_error,
                    "Payout moved to dead letter queue"
                );
                self.notifier.publish(SettlementEvent::PayoutDeadLettered {
                    payout_id: id,
                    attempts: record.attempt_count,
                    last_error: last_error.clone(),
                });
                self.notifier.publish(SettlementEvent::alert(
                    AlertSeverity::Critical,
                    "retry_engine",
                    format!(
                        "payout {} dead-lettered after {} attempts: {}",
                        id, record.attempt_count, last_error
                    ),
                ));
                AttemptOutcome::Failed(FailureDisposition::DeadLettered)
            }
            Err(e) => {
                error!(payout_id = %id, error = %e, "Failed to record payout failure");
                AttemptOutcome::Skipped
            }
        }
    }

    // ========================================================================
    // Receipt follow-up
    // ========================================================================

    /// Promote SENT payouts to CONFIRMED once deep enough, or FAILED if reverted.
    pub async fn follow_up_receipts(&self) -> Result<FollowUpSummary, PayoutError> {
        let sent = self.store.sent_payouts().await?;
        let mut summary = FollowUpSummary::default();
        if sent.is_empty() {
            return Ok(summary);
        }
        let tip = self.access.block_number().await?;

        for entry in sent {
            let id = entry.payout.id;
            let receipt = match self.access.transaction_receipt(&entry.tx_hash).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    summary.pending += 1;
                    continue;
                }
                Err(e) => {
                    warn!(payout_id = %id, error = %e, "Receipt lookup failed");
                    summary.pending += 1;
                    continue;
                }
            };

            if !receipt.success {
                self.store.finalize_payout(id, PayoutStatus::Failed).await?;
                error!(payout_id = %id, tx_hash = %entry.tx_hash, "Payout transaction reverted");
                self.notifier.publish(SettlementEvent::alert(
                    AlertSeverity::Critical,
                    "retry_engine",
                    format!(
                        "payout {} transaction {} reverted in block {}",
                        id, entry.tx_hash, receipt.block_number
                    ),
                ));
                summary.failed += 1;
                continue;
            }

            if tip.saturating_sub(receipt.block_number) < self.config.confirmation_depth {
                summary.pending += 1;
                continue;
            }

            self.store.finalize_payout(id, PayoutStatus::Confirmed).await?;
            info!(
                payout_id = %id,
                tx_hash = %entry.tx_hash,
                block_number = receipt.block_number,
                "Payout confirmed"
            );
            self.notifier.publish(SettlementEvent::PayoutConfirmed {
                payout_id: id,
                tx_hash: entry.tx_hash,
                block_number: receipt.block_number,
            });
            summary.confirmed += 1;
        }
        Ok(summary)
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    /// DEAD_LETTER -> RETRYING with attempts reset; picked up by the next sweep.
    pub async fn operator_retry(
        &self,
        id: Uuid,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, PayoutError> {
        let record = self
            .store
            .operator_retry(id, operator, now)
            .await
            .map_err(|e| operator_error(id, e))?;
        warn!(payout_id = %id, operator, "Operator re-queued dead-lettered payout");
        Ok(record)
    }

    /// Settle a dead-lettered payout with a transaction made outside the engine.
    pub async fn manual_resolve(
        &self,
        id: Uuid,
        operator: &str,
        tx_hash: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, PayoutError> {
        if tx_hash.trim().is_empty() {
            return Err(PayoutError::InvalidRequest("tx_hash is empty".into()));
        }
        let record = self
            .store
            .manual_resolve(id, operator, tx_hash, note, now)
            .await
            .map_err(|e| operator_error(id, e))?;
        warn!(payout_id = %id, operator, tx_hash, "Payout manually resolved");
        self.notifier.publish(SettlementEvent::PayoutResolved {
            payout_id: id,
            tx_hash: tx_hash.to_lowercase(),
        });
        Ok(record)
    }

    pub async fn dead_letters(&self) -> Result<Vec<RetryRecord>, PayoutError> {
        Ok(self.store.dead_letters().await?)
    }

    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditEntry>, PayoutError> {
        Ok(self.store.audit_entries(id).await?)
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    /// Run sweeps until `shutdown` flips to true. An in-progress sweep completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.config.policy.max_attempts,
            "Starting payout retry engine"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                error!(error = %e, code = e.code(), "Retry sweep failed");
            }
            if let Err(e) = self.follow_up_receipts().await {
                error!(error = %e, code = e.code(), "Receipt follow-up failed");
            }
        }
        info!("Payout retry engine stopped");
    }
}

fn operator_error(id: Uuid, e: StoreError) -> PayoutError {
    match e {
        StoreError::NotFound(_) => PayoutError::NotFound(id),
        StoreError::Conflict(_) => PayoutError::NotDeadLettered(id),
        other => PayoutError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::chain::{
        ChainAccessConfig, ChainError, LocalKeySigner, RateLimitParams, RetrySettings, RpcTier,
    };
    use crate::events::testing::RecordingNotifier;
    use crate::payout::dispatcher::DispatcherConfig;
    use crate::payout::store::AuditAction;
    use crate::payout::types::RetryState;
    use crate::persistence::MemoryStore;

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
    const DEST: &str = "0x3333333333333333333333333333333333333333";

    struct Harness {
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        engine: RetryEngine,
    }

    fn harness() -> Harness {
        let chain = Arc::new(MockChain::new());
        let access = Arc::new(
            ChainAccess::new(
                chain.clone(),
                ChainAccessConfig {
                    limits: RateLimitParams::for_tier(RpcTier::Enterprise),
                    retry: RetrySettings {
                        max_retries: 0,
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(1),
                    },
                    log_chunk_size: 100,
                },
            )
            .unwrap(),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(PaymentDispatcher::new(
            access.clone(),
            Arc::new(LocalKeySigner::from_hex(TEST_KEY).unwrap()),
            notifier.clone(),
            DispatcherConfig {
                token_contract: TOKEN.into(),
                ..DispatcherConfig::default()
            },
        ));
        let store = Arc::new(MemoryStore::new());
        let engine = RetryEngine::new(
            store.clone(),
            dispatcher,
            access,
            notifier.clone(),
            RetryEngineConfig::default(),
        );
        Harness {
            chain,
            store,
            notifier,
            engine,
        }
    }

    fn earning(destination: &str, amount: &str) -> EarningRecord {
        EarningRecord {
            id: Uuid::new_v4(),
            destination: destination.into(),
            amount: MoneyAmount::parse(amount).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_sweep_resolves_and_marks_earnings_paid() {
        let h = harness();
        let now = Utc::now();
        let earnings = vec![earning(DEST, "1.5"), earning(DEST, "2.5")];
        let queued = h.engine.enqueue_earnings(&earnings, now).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].amount, MoneyAmount::from_whole(4));

        let summary = h.engine.sweep(now).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(h.chain.sent().len(), 1);

        let id = queued[0].id;
        let payout = h.store.get_payout(id).await.unwrap().unwrap();
        assert_eq!(payout.status, PayoutStatus::Sent);
        let record = h.store.get_retry_record(id).await.unwrap().unwrap();
        assert_eq!(record.state, RetryState::Resolved);
        assert!(record.resolved && !record.in_dead_letter);
        assert_eq!(record.last_tx_hash.as_deref(), Some(h.chain.sent()[0].as_str()));
        for e in &earnings {
            assert!(h.store.is_earning_paid(e.id).await.unwrap());
        }
        assert_eq!(h.notifier.count("payout_resolved"), 1);

        // resolved records are never claimed again
        assert_eq!(h.engine.sweep(now + chrono::Duration::hours(1)).await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_retriable_failures_back_off_then_dead_letter() {
        let h = harness();
        h.chain.set_native_balance(0);
        let start = Utc::now();
        let payout = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(10), vec![], start)
            .await
            .unwrap();

        let mut now = start;
        let mut gaps = Vec::new();
        for _ in 0..4 {
            let summary = h.engine.sweep(now).await.unwrap();
            assert_eq!(summary.rescheduled, 1);
            let record = h.store.get_retry_record(payout.id).await.unwrap().unwrap();
            let next = record.next_retry_at.unwrap();
            gaps.push((next - now).num_minutes());

            // not due yet
            let early = h.engine.sweep(next - chrono::Duration::seconds(1)).await.unwrap();
            assert_eq!(early.claimed, 0);
            now = next;
        }
        assert_eq!(gaps, vec![1, 2, 4, 8]);

        let summary = h.engine.sweep(now).await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        let record = h.store.get_retry_record(payout.id).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 5);
        assert!(record.in_dead_letter);
        assert!(record.next_retry_at.is_none());
        assert!(h.chain.sent().is_empty());
        assert_eq!(h.notifier.count("payout_dead_lettered"), 1);
        assert_eq!(h.engine.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_dead_letters_immediately() {
        let h = harness();
        let now = Utc::now();
        let zero = "0x0000000000000000000000000000000000000000";
        let payout = h
            .engine
            .enqueue_payout(zero, MoneyAmount::from_whole(1), vec![], now)
            .await
            .unwrap();

        let summary = h.engine.sweep(now).await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        let record = h.store.get_retry_record(payout.id).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.state, RetryState::DeadLetter);
        assert!(record.last_error.unwrap().starts_with("INVALID_DESTINATION"));
        assert_eq!(h.notifier.count("alert"), 1);
    }

    #[tokio::test]
    async fn test_persisted_tx_is_not_broadcast_twice() {
        let h = harness();
        let now = Utc::now();
        let payout = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(3), vec![], now)
            .await
            .unwrap();

        // a previous attempt persisted its hash, then lost the node response
        let hash = "0x00000000000000000000000000000000000000000000000000000000000000aa";
        h.store.record_attempt_tx(payout.id, hash).await.unwrap();
        h.chain.set_receipt(hash, 7, true);

        let summary = h.engine.sweep(now).await.unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.recovered, 1);
        assert!(h.chain.sent().is_empty());
        let record = h.store.get_retry_record(payout.id).await.unwrap().unwrap();
        assert_eq!(record.last_tx_hash.as_deref(), Some(hash));
    }

    #[tokio::test]
    async fn test_mempool_tx_counts_as_sent() {
        let h = harness();
        let now = Utc::now();
        let payout = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(3), vec![], now)
            .await
            .unwrap();
        let hash = "0x00000000000000000000000000000000000000000000000000000000000000bb";
        h.store.record_attempt_tx(payout.id, hash).await.unwrap();
        h.chain.mark_known(hash);

        assert_eq!(h.engine.sweep(now).await.unwrap().recovered, 1);
        assert!(h.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_rescheduled_then_succeeds() {
        let h = harness();
        let now = Utc::now();
        let payout = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(3), vec![], now)
            .await
            .unwrap();
        h.chain
            .fail_next_send(ChainError::RpcConnection("connection reset".into()));

        let summary = h.engine.sweep(now).await.unwrap();
        assert_eq!(summary.rescheduled, 1);
        let record = h.store.get_retry_record(payout.id).await.unwrap().unwrap();
        assert!(record.last_tx_hash.is_some());

        let later = record.next_retry_at.unwrap();
        let summary = h.engine.sweep(later).await.unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.recovered, 0);
        assert_eq!(h.chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_operator_retry_and_manual_resolve_are_audited() {
        let h = harness();
        let now = Utc::now();
        let zero = "0x0000000000000000000000000000000000000000";
        let a = h
            .engine
            .enqueue_payout(zero, MoneyAmount::from_whole(1), vec![], now)
            .await
            .unwrap();
        let b = h
            .engine
            .enqueue_payout(zero, MoneyAmount::from_whole(2), vec![], now)
            .await
            .unwrap();
        h.engine.sweep(now).await.unwrap();

        let record = h.engine.operator_retry(a.id, "ops-alice", now).await.unwrap();
        assert_eq!(record.state, RetryState::Retrying);
        assert_eq!(record.attempt_count, 0);
        assert!(!record.in_dead_letter);

        // only dead-lettered payouts can be retried
        let err = h.engine.operator_retry(a.id, "ops-alice", now).await.unwrap_err();
        assert!(matches!(err, PayoutError::NotDeadLettered(_)));

        let hash = "0x00000000000000000000000000000000000000000000000000000000000000cc";
        let record = h
            .engine
            .manual_resolve(b.id, "ops-bob", hash, Some("paid from cold wallet"), now)
            .await
            .unwrap();
        assert!(record.resolved && !record.in_dead_letter);

        let trail = h.engine.audit_trail(a.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::OperatorRetry);
        let trail = h.engine.audit_trail(b.id).await.unwrap();
        assert_eq!(trail[0].action, AuditAction::ManualResolve);
        assert_eq!(trail[0].operator, "ops-bob");

        let missing = h.engine.operator_retry(Uuid::new_v4(), "ops", now).await.unwrap_err();
        assert!(matches!(missing, PayoutError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_follow_up_confirms_deep_receipts_and_fails_reverts() {
        let h = harness();
        let now = Utc::now();
        let good = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(1), vec![], now)
            .await
            .unwrap();
        let bad = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(2), vec![], now)
            .await
            .unwrap();
        h.engine.sweep(now).await.unwrap();

        let hash_of = |id| {
            let store = h.store.clone();
            async move {
                store
                    .get_retry_record(id)
                    .await
                    .unwrap()
                    .unwrap()
                    .last_tx_hash
                    .unwrap()
            }
        };
        let good_hash = hash_of(good.id).await;
        let bad_hash = hash_of(bad.id).await;

        h.chain.mine_to(10);
        h.chain.set_receipt(&good_hash, 10, true);
        h.chain.set_receipt(&bad_hash, 10, false);
        h.chain.mine_to(21);

        let summary = h.engine.follow_up_receipts().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);

        h.chain.mine_to(22);
        let summary = h.engine.follow_up_receipts().await.unwrap();
        assert_eq!(summary.confirmed, 1);

        let good = h.store.get_payout(good.id).await.unwrap().unwrap();
        assert_eq!(good.status, PayoutStatus::Confirmed);
        let bad = h.store.get_payout(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, PayoutStatus::Failed);
        assert_eq!(h.notifier.count("payout_confirmed"), 1);
    }

    #[tokio::test]
    async fn test_enqueue_validation_and_close() {
        let h = harness();
        let now = Utc::now();
        let err = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::zero(), vec![], now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYOUT_REQUEST");

        let e = earning(DEST, "1");
        h.engine.enqueue_earnings(&[e.clone()], now).await.unwrap();
        // an earning can only back one payout
        let dup = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(1), vec![e.id], now)
            .await;
        assert!(matches!(dup, Err(PayoutError::Store(StoreError::Conflict(_)))));

        h.engine.close();
        let closed = h
            .engine
            .enqueue_payout(DEST, MoneyAmount::from_whole(1), vec![], now)
            .await;
        assert!(matches!(closed, Err(PayoutError::ShuttingDown)));
    }
}
