//! In-process store.
//!
//! All state sits behind one async mutex, so every trait method is a
//! serialisable transaction. Each method validates before it mutates, leaving
//! the state untouched on error.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::StoreError;
use crate::chain::TransferKey;
use crate::chain::types::same_address;
use crate::deposit::store::DepositStore;
use crate::deposit::types::{
    Confirmation, DepositIntent, IntentStatus, ProductKind, RoiApplication, RoiLedger,
};
use crate::money::MoneyAmount;
use crate::payout::error::{PaymentFailure, PayoutError};
use crate::payout::store::{AuditAction, AuditEntry, PayoutStore, SentPayout};
use crate::payout::types::{
    EarningRecord, FailureDisposition, PayoutRequest, PayoutStatus, RetryPolicy, RetryRecord,
    RetryState,
};

#[derive(Debug, Clone)]
struct StoredEarning {
    paid: bool,
    payout_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    owner: String,
    intent_id: Uuid,
    amount: MoneyAmount,
}

#[derive(Default)]
struct MemoryState {
    intents: HashMap<Uuid, DepositIntent>,
    processed: HashMap<TransferKey, Uuid>,
    balances: HashMap<String, MoneyAmount>,
    ledger: Vec<LedgerEntry>,
    roi: HashMap<Uuid, RoiLedger>,
    earnings: HashMap<Uuid, StoredEarning>,
    payouts: HashMap<Uuid, PayoutRequest>,
    records: HashMap<Uuid, RetryRecord>,
    transactions: HashMap<Uuid, String>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn record(&self, id: Uuid) -> Result<&RetryRecord, StoreError> {
        self.records
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("retry record {}", id)))
    }

    /// Flip the payout to SENT, mark its earnings paid and write the tx row.
    fn settle(&mut self, record: RetryRecord, tx_hash: &str) -> Result<RetryRecord, StoreError> {
        let id = record.payout_request_id;
        let payout = self
            .payouts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))?;
        payout.status = PayoutStatus::Sent;
        for earning_id in &payout.source_refs {
            if let Some(earning) = self.earnings.get_mut(earning_id) {
                earning.paid = true;
            }
        }
        self.transactions.insert(id, tx_hash.to_lowercase());
        self.records.insert(id, record.clone());
        Ok(record)
    }
}

fn conflict(e: PayoutError) -> StoreError {
    StoreError::Conflict(e.to_string())
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger credits written for an owner
    pub async fn ledger_entry_count(&self, owner: &str) -> usize {
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.owner == owner)
            .count()
    }

    /// Sum of ledger credits for one intent
    pub async fn ledger_total_for(&self, intent_id: Uuid) -> MoneyAmount {
        let state = self.state.lock().await;
        MoneyAmount::sum(
            state
                .ledger
                .iter()
                .filter(|e| e.intent_id == intent_id)
                .map(|e| &e.amount),
        )
    }
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn insert_intent(&self, intent: &DepositIntent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.intents.contains_key(&intent.id) {
            return Err(StoreError::Duplicate(format!("intent {}", intent.id)));
        }
        state.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<DepositIntent>, StoreError> {
        Ok(self.state.lock().await.intents.get(&id).cloned())
    }

    async fn pending_intents_for(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DepositIntent>, StoreError> {
        let state = self.state.lock().await;
        let mut intents: Vec<DepositIntent> = state
            .intents
            .values()
            .filter(|i| i.status == IntentStatus::Pending)
            .filter(|i| i.expires_at > now)
            .filter(|i| same_address(&i.receiving_address, address))
            .cloned()
            .collect();
        intents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(intents)
    }

    async fn is_transfer_processed(&self, key: &TransferKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.processed.contains_key(key))
    }

    async fn commit_confirmation(
        &self,
        confirmation: &Confirmation,
    ) -> Result<DepositIntent, StoreError> {
        let mut state = self.state.lock().await;
        let key = TransferKey {
            tx_hash: confirmation.tx_hash.to_lowercase(),
            log_index: confirmation.log_index,
        };
        if state.processed.contains_key(&key) {
            return Err(StoreError::Duplicate(format!("transfer {}", key)));
        }

        let intent = state
            .intents
            .get(&confirmation.intent_id)
            .ok_or_else(|| StoreError::NotFound(format!("intent {}", confirmation.intent_id)))?;
        if intent.status != IntentStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "intent {} is {}",
                intent.id, intent.status
            )));
        }
        if intent.expires_at <= confirmation.confirmed_at {
            return Err(StoreError::Conflict(format!("intent {} expired", intent.id)));
        }

        let mut confirmed = intent.clone();
        confirmed.status = IntentStatus::Confirmed;
        confirmed.actual_amount = Some(confirmation.actual_amount.clone());
        confirmed.confirming_tx = Some(key.tx_hash.clone());
        confirmed.confirming_block = Some(confirmation.block_number);

        state.processed.insert(key, confirmed.id);
        let balance = state
            .balances
            .entry(confirmed.owner.clone())
            .or_insert_with(MoneyAmount::zero);
        *balance = balance.add(&confirmation.actual_amount);
        state.ledger.push(LedgerEntry {
            owner: confirmed.owner.clone(),
            intent_id: confirmed.id,
            amount: confirmation.actual_amount.clone(),
        });
        if confirmed.product == ProductKind::CappedReturn {
            state.roi.insert(
                confirmed.id,
                RoiLedger::new(
                    confirmed.id,
                    &confirmation.actual_amount,
                    confirmation.roi_cap_multiple,
                ),
            );
        }
        state.intents.insert(confirmed.id, confirmed.clone());
        Ok(confirmed)
    }

    async fn expire_stale_intents(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for intent in state.intents.values_mut() {
            if intent.status == IntentStatus::Pending && intent.expires_at <= now {
                intent.status = IntentStatus::Expired;
                expired.push(intent.id);
            }
        }
        expired.sort();
        Ok(expired)
    }

    async fn roi_ledger(&self, intent_id: Uuid) -> Result<Option<RoiLedger>, StoreError> {
        Ok(self.state.lock().await.roi.get(&intent_id).cloned())
    }

    async fn apply_roi_payment(
        &self,
        intent_id: Uuid,
        proposed: &MoneyAmount,
        now: DateTime<Utc>,
    ) -> Result<RoiApplication, StoreError> {
        let mut state = self.state.lock().await;
        let ledger = state
            .roi
            .get_mut(&intent_id)
            .ok_or_else(|| StoreError::NotFound(format!("roi ledger {}", intent_id)))?;
        Ok(ledger.apply(proposed, now))
    }

    async fn balance_of(&self, owner: &str) -> Result<MoneyAmount, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(owner)
            .cloned()
            .unwrap_or_else(MoneyAmount::zero))
    }
}

#[async_trait]
impl PayoutStore for MemoryStore {
    async fn insert_earnings(&self, earnings: &[EarningRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for earning in earnings {
            state.earnings.entry(earning.id).or_insert(StoredEarning {
                paid: false,
                payout_id: None,
            });
        }
        Ok(())
    }

    async fn is_earning_paid(&self, earning_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .earnings
            .get(&earning_id)
            .is_some_and(|e| e.paid))
    }

    async fn create_payout(
        &self,
        request: &PayoutRequest,
        record: &RetryRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.payouts.contains_key(&request.id) {
            return Err(StoreError::Duplicate(format!("payout {}", request.id)));
        }
        for earning_id in &request.source_refs {
            if let Some(owner) = state.earnings.get(earning_id).and_then(|e| e.payout_id) {
                return Err(StoreError::Conflict(format!(
                    "earning {} already belongs to payout {}",
                    earning_id, owner
                )));
            }
        }

        for earning_id in &request.source_refs {
            let earning = state.earnings.entry(*earning_id).or_insert(StoredEarning {
                paid: false,
                payout_id: None,
            });
            earning.payout_id = Some(request.id);
        }
        state.payouts.insert(request.id, request.clone());
        state.records.insert(request.id, record.clone());
        Ok(())
    }

    async fn get_payout(&self, id: Uuid) -> Result<Option<PayoutRequest>, StoreError> {
        Ok(self.state.lock().await.payouts.get(&id).cloned())
    }

    async fn get_retry_record(&self, id: Uuid) -> Result<Option<RetryRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<(Option<DateTime<Utc>>, Uuid)> = state
            .records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| (r.next_retry_at, r.payout_request_id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = state.records.get_mut(&id) {
                record.lease_until = Some(now + lease);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_attempt_tx(&self, id: Uuid, tx_hash: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("retry record {}", id)))?;
        if record.state.is_parked() {
            return Err(StoreError::Conflict(format!("retry record {} is {}", id, record.state)));
        }
        record.last_tx_hash = Some(tx_hash.to_lowercase());
        Ok(())
    }

    async fn resolve_payout(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        let mut state = self.state.lock().await;
        let mut record = state.record(id)?.clone();
        if record.state == RetryState::DeadLetter {
            return Err(StoreError::Conflict(format!("retry record {} is dead-lettered", id)));
        }
        record.mark_resolved(tx_hash, now).map_err(conflict)?;
        state.settle(record, tx_hash)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        failure: &PaymentFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(RetryRecord, FailureDisposition), StoreError> {
        let mut state = self.state.lock().await;
        let mut record = state.record(id)?.clone();
        let disposition = record.apply_failure(failure, policy, now).map_err(conflict)?;
        state.records.insert(id, record.clone());
        Ok((record, disposition))
    }

    async fn operator_retry(
        &self,
        id: Uuid,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        let mut state = self.state.lock().await;
        let mut record = state.record(id)?.clone();
        record.reset_for_operator(now).map_err(conflict)?;
        state.records.insert(id, record.clone());
        state.audit.push(AuditEntry {
            payout_request_id: id,
            operator: operator.to_string(),
            action: AuditAction::OperatorRetry,
            note: None,
            created_at: now,
        });
        Ok(record)
    }

    async fn manual_resolve(
        &self,
        id: Uuid,
        operator: &str,
        tx_hash: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        let mut state = self.state.lock().await;
        let mut record = state.record(id)?.clone();
        if record.state != RetryState::DeadLetter {
            return Err(StoreError::Conflict(format!(
                "retry record {} is {}, not DEAD_LETTER",
                id, record.state
            )));
        }
        record.mark_resolved(tx_hash, now).map_err(conflict)?;
        let record = state.settle(record, tx_hash)?;
        state.audit.push(AuditEntry {
            payout_request_id: id,
            operator: operator.to_string(),
            action: AuditAction::ManualResolve,
            note: note.map(str::to_string),
            created_at: now,
        });
        Ok(record)
    }

    async fn dead_letters(&self) -> Result<Vec<RetryRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<RetryRecord> = state
            .records
            .values()
            .filter(|r| r.in_dead_letter)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }

    async fn sent_payouts(&self) -> Result<Vec<SentPayout>, StoreError> {
        let state = self.state.lock().await;
        let mut sent: Vec<SentPayout> = state
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Sent)
            .filter_map(|p| {
                state.transactions.get(&p.id).map(|tx| SentPayout {
                    payout: p.clone(),
                    tx_hash: tx.clone(),
                })
            })
            .collect();
        sent.sort_by(|a, b| a.payout.created_at.cmp(&b.payout.created_at).then(a.payout.id.cmp(&b.payout.id)));
        Ok(sent)
    }

    async fn finalize_payout(&self, id: Uuid, status: PayoutStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let payout = state
            .payouts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))?;
        if payout.status != PayoutStatus::Sent {
            return Err(StoreError::Conflict(format!("payout {} is {}", id, payout.status)));
        }
        payout.status = status;
        Ok(())
    }

    async fn audit_entries(&self, id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|a| a.payout_request_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit::types::NewDepositIntent;
    use crate::payout::error::FailureKind;

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn intent(now: DateTime<Utc>) -> DepositIntent {
        DepositIntent::new(
            NewDepositIntent {
                owner: "alice".into(),
                expected_amount: MoneyAmount::from_whole(10),
                receiving_address: ADDR.into(),
                tolerance_bps: None,
                product: ProductKind::CappedReturn,
            },
            200,
            Duration::hours(24),
            now,
        )
    }

    fn confirmation(intent_id: Uuid, tx: &str, now: DateTime<Utc>) -> Confirmation {
        Confirmation {
            intent_id,
            tx_hash: tx.into(),
            log_index: 0,
            block_number: 100,
            from_address: "0x2222222222222222222222222222222222222222".into(),
            actual_amount: MoneyAmount::from_whole(10),
            roi_cap_multiple: 5,
            confirmed_at: now,
        }
    }

    #[tokio::test]
    async fn test_confirmation_is_exactly_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let i = intent(now);
        store.insert_intent(&i).await.unwrap();

        let confirmed = store.commit_confirmation(&confirmation(i.id, "0xAA", now)).await.unwrap();
        assert_eq!(confirmed.status, IntentStatus::Confirmed);
        assert_eq!(confirmed.confirming_tx.as_deref(), Some("0xaa"));

        let again = store.commit_confirmation(&confirmation(i.id, "0xaa", now)).await;
        assert!(matches!(again, Err(StoreError::Duplicate(_))));

        // a different transfer cannot confirm the same intent
        let other = store.commit_confirmation(&confirmation(i.id, "0xbb", now)).await;
        assert!(matches!(other, Err(StoreError::Conflict(_))));

        assert_eq!(store.balance_of("alice").await.unwrap(), MoneyAmount::from_whole(10));
        assert_eq!(store.ledger_entry_count("alice").await, 1);
        let roi = store.roi_ledger(i.id).await.unwrap().unwrap();
        assert_eq!(roi.cap_amount, MoneyAmount::from_whole(50));
    }

    #[tokio::test]
    async fn test_expired_intent_cannot_confirm() {
        let store = MemoryStore::new();
        let created = Utc::now() - Duration::hours(30);
        let i = intent(created);
        store.insert_intent(&i).await.unwrap();

        let now = Utc::now();
        assert!(store.pending_intents_for(ADDR, now).await.unwrap().is_empty());
        let result = store.commit_confirmation(&confirmation(i.id, "0xaa", now)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(!store.is_transfer_processed(&TransferKey { tx_hash: "0xaa".into(), log_index: 0 }).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_sets_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = PayoutRequest {
            id: Uuid::new_v4(),
            destination: ADDR.into(),
            amount: MoneyAmount::from_whole(1),
            source_refs: vec![],
            status: PayoutStatus::Queued,
            created_at: now,
        };
        store
            .create_payout(&request, &RetryRecord::new(request.id, 5, now))
            .await
            .unwrap();

        let claimed = store.claim_due(now, Duration::minutes(5), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due(now, Duration::minutes(5), 10).await.unwrap().is_empty());
        // lease expiry makes the record claimable again
        let later = now + Duration::minutes(6);
        assert_eq!(store.claim_due(later, Duration::minutes(5), 10).await.unwrap().len(), 1);

        let failure = PaymentFailure::new(FailureKind::Network, "timeout");
        let (record, _) = store
            .record_failure(request.id, &failure, &RetryPolicy::default(), later)
            .await
            .unwrap();
        assert!(record.lease_until.is_none());
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_resolve_rejects_dead_letter() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = PayoutRequest {
            id: Uuid::new_v4(),
            destination: ADDR.into(),
            amount: MoneyAmount::from_whole(1),
            source_refs: vec![],
            status: PayoutStatus::Queued,
            created_at: now,
        };
        store
            .create_payout(&request, &RetryRecord::new(request.id, 1, now))
            .await
            .unwrap();
        let failure = PaymentFailure::new(FailureKind::Network, "timeout");
        store
            .record_failure(request.id, &failure, &RetryPolicy::default(), now)
            .await
            .unwrap();

        let result = store.resolve_payout(request.id, "0xabc", now).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(
            store.get_payout(request.id).await.unwrap().unwrap().status,
            PayoutStatus::Queued
        );
    }
}
