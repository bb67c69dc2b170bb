//! Payout persistence boundary.
//!
//! Every method that changes a retry record locks that single record for the
//! duration of its transaction. `resolve_payout` and `manual_resolve` mark the
//! source earnings paid, write the outbound transaction row and flip the
//! payout to SENT in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::PaymentFailure;
use super::types::{
    EarningRecord, FailureDisposition, PayoutRequest, PayoutStatus, RetryPolicy, RetryRecord,
};
use crate::persistence::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    OperatorRetry,
    ManualResolve,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::OperatorRetry => "OPERATOR_RETRY",
            AuditAction::ManualResolve => "MANUAL_RESOLVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub payout_request_id: Uuid,
    pub operator: String,
    pub action: AuditAction,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A payout awaiting on-chain finality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayout {
    pub payout: PayoutRequest,
    pub tx_hash: String,
}

#[async_trait]
pub trait PayoutStore: Send + Sync {
    async fn insert_earnings(&self, earnings: &[EarningRecord]) -> Result<(), StoreError>;

    async fn is_earning_paid(&self, earning_id: Uuid) -> Result<bool, StoreError>;

    /// Create the payout and its QUEUED retry record together.
    /// An earning already attached to another payout is a [`StoreError::Conflict`].
    async fn create_payout(
        &self,
        request: &PayoutRequest,
        record: &RetryRecord,
    ) -> Result<(), StoreError>;

    async fn get_payout(&self, id: Uuid) -> Result<Option<PayoutRequest>, StoreError>;

    async fn get_retry_record(&self, id: Uuid) -> Result<Option<RetryRecord>, StoreError>;

    /// Claim up to `limit` due records, leasing them until `now + lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError>;

    /// Persist the signed transaction hash before it is broadcast.
    async fn record_attempt_tx(&self, id: Uuid, tx_hash: &str) -> Result<(), StoreError>;

    async fn resolve_payout(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError>;

    async fn record_failure(
        &self,
        id: Uuid,
        failure: &PaymentFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(RetryRecord, FailureDisposition), StoreError>;

    /// DEAD_LETTER -> RETRYING, attempts reset, audited.
    async fn operator_retry(
        &self,
        id: Uuid,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError>;

    /// Resolve a dead-lettered payout with an externally settled tx, audited.
    async fn manual_resolve(
        &self,
        id: Uuid,
        operator: &str,
        tx_hash: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError>;

    async fn dead_letters(&self) -> Result<Vec<RetryRecord>, StoreError>;

    async fn sent_payouts(&self) -> Result<Vec<SentPayout>, StoreError>;

    /// SENT -> CONFIRMED / FAILED
    async fn finalize_payout(&self, id: Uuid, status: PayoutStatus) -> Result<(), StoreError>;

    async fn audit_entries(&self, id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}
