//! Deposit persistence boundary.
//!
//! Implemented by [`crate::persistence::PgSettlementStore`] (PostgreSQL) and
//! [`crate::persistence::MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{Confirmation, DepositIntent, RoiApplication, RoiLedger};
use crate::chain::TransferKey;
use crate::money::MoneyAmount;
use crate::persistence::StoreError;

#[async_trait]
pub trait DepositStore: Send + Sync {
    async fn insert_intent(&self, intent: &DepositIntent) -> Result<(), StoreError>;

    async fn get_intent(&self, id: Uuid) -> Result<Option<DepositIntent>, StoreError>;

    /// PENDING, unexpired intents for a receiving address (case-insensitive)
    async fn pending_intents_for(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DepositIntent>, StoreError>;

    async fn is_transfer_processed(&self, key: &TransferKey) -> Result<bool, StoreError>;

    /// Confirm one intent in a single transaction:
    /// record the transfer key, lock and re-check the intent, mark it CONFIRMED,
    /// credit the owner's balance and ledger, and open the ROI ledger for
    /// capped-return products.
    ///
    /// Errors with [`StoreError::Duplicate`] if the transfer was already processed
    /// and [`StoreError::Conflict`] if the intent is no longer PENDING.
    async fn commit_confirmation(
        &self,
        confirmation: &Confirmation,
    ) -> Result<DepositIntent, StoreError>;

    /// Mark PENDING intents whose `expires_at <= now` as EXPIRED; returns their ids.
    async fn expire_stale_intents(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn roi_ledger(&self, intent_id: Uuid) -> Result<Option<RoiLedger>, StoreError>;

    /// Cap `proposed` against the intent's ROI ledger under a row lock.
    async fn apply_roi_payment(
        &self,
        intent_id: Uuid,
        proposed: &MoneyAmount,
        now: DateTime<Utc>,
    ) -> Result<RoiApplication, StoreError>;

    async fn balance_of(&self, owner: &str) -> Result<MoneyAmount, StoreError>;
}
