use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::chain::ChainError;
use crate::money::{MoneyAmount, MoneyError};
use crate::persistence::StoreError;

/// Default match tolerance: 2%
pub const DEFAULT_TOLERANCE_BPS: u32 = 200;

/// Default ROI cap as a multiple of the confirmed deposit
pub const DEFAULT_ROI_CAP_MULTIPLE: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "PENDING",
            IntentStatus::Confirmed => "CONFIRMED",
            IntentStatus::Failed => "FAILED",
            IntentStatus::Expired => "EXPIRED",
        }
    }

    /// CONFIRMED and FAILED never change again
    pub fn is_final(&self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::Failed)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = DepositError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IntentStatus::Pending),
            "CONFIRMED" => Ok(IntentStatus::Confirmed),
            "FAILED" => Ok(IntentStatus::Failed),
            "EXPIRED" => Ok(IntentStatus::Expired),
            other => Err(DepositError::InvalidState(other.to_string())),
        }
    }
}

/// Deposit product. Capped-return deposits carry an [`RoiLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    #[default]
    Flexible,
    CappedReturn,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Flexible => "FLEXIBLE",
            ProductKind::CappedReturn => "CAPPED_RETURN",
        }
    }
}

impl FromStr for ProductKind {
    type Err = DepositError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FLEXIBLE" => Ok(ProductKind::Flexible),
            "CAPPED_RETURN" => Ok(ProductKind::CappedReturn),
            other => Err(DepositError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositIntent {
    pub id: Uuid,
    pub owner: String,
    pub expected_amount: MoneyAmount,
    pub receiving_address: String,
    pub tolerance_bps: u32,
    pub product: ProductKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub actual_amount: Option<MoneyAmount>,
    pub confirming_tx: Option<String>,
    pub confirming_block: Option<u64>,
}

/// Input for a new intent
#[derive(Debug, Clone)]
pub struct NewDepositIntent {
    pub owner: String,
    pub expected_amount: MoneyAmount,
    pub receiving_address: String,
    pub tolerance_bps: Option<u32>,
    pub product: ProductKind,
}

impl DepositIntent {
    pub fn new(
        input: NewDepositIntent,
        default_tolerance_bps: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: input.owner,
            expected_amount: input.expected_amount,
            receiving_address: input.receiving_address.to_lowercase(),
            tolerance_bps: input.tolerance_bps.unwrap_or(default_tolerance_bps),
            product: input.product,
            created_at: now,
            expires_at: now + ttl,
            status: IntentStatus::Pending,
            actual_amount: None,
            confirming_tx: None,
            confirming_block: None,
        }
    }
}

/// Payout cap attached to a confirmed capped-return deposit.
///
/// `paid_amount <= cap_amount` always; `completed` flips to true exactly once,
/// when the cap is reached, and never back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoiLedger {
    pub intent_id: Uuid,
    pub cap_amount: MoneyAmount,
    pub paid_amount: MoneyAmount,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoiApplication {
    pub granted: MoneyAmount,
    pub paid_amount: MoneyAmount,
    pub completed: bool,
    /// True only for the payment that reached the cap
    pub just_completed: bool,
}

impl RoiLedger {
    pub fn new(intent_id: Uuid, deposit: &MoneyAmount, multiple: i64) -> Self {
        Self {
            intent_id,
            cap_amount: deposit.mul_int(multiple),
            paid_amount: MoneyAmount::zero(),
            completed: false,
            completed_at: None,
        }
    }

    pub fn remaining(&self) -> MoneyAmount {
        self.cap_amount.sub(&self.paid_amount).max(MoneyAmount::zero())
    }

    /// Grant as much of `proposed` as fits under the cap.
    pub fn apply(&mut self, proposed: &MoneyAmount, now: DateTime<Utc>) -> RoiApplication {
        if self.completed || !proposed.is_positive() {
            return RoiApplication {
                granted: MoneyAmount::zero(),
                paid_amount: self.paid_amount.clone(),
                completed: self.completed,
                just_completed: false,
            };
        }

        let granted = proposed.clone().min(self.remaining());
        self.paid_amount = self.paid_amount.add(&granted);

        let just_completed = self.paid_amount >= self.cap_amount;
        if just_completed {
            self.completed = true;
            self.completed_at = Some(now);
        }

        RoiApplication {
            granted,
            paid_amount: self.paid_amount.clone(),
            completed: self.completed,
            just_completed,
        }
    }
}

/// Result of reconciling one confirmed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Confirmed {
        intent_id: Uuid,
        owner: String,
        actual_amount: MoneyAmount,
    },
    /// `(tx_hash, log_index)` was already processed
    Duplicate,
    /// No pending intent matched; nothing changed
    Unmatched { reason: String },
}

/// Data written atomically when an intent is confirmed
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub intent_id: Uuid,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub from_address: String,
    pub actual_amount: MoneyAmount,
    pub roi_cap_multiple: i64,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Transfer already processed (idempotent check)")]
    AlreadyProcessed,

    #[error("Intent {0} is no longer pending")]
    IntentNotPending(Uuid),

    #[error("Intent not found: {0}")]
    IntentNotFound(Uuid),

    #[error("Intent {0} has no ROI ledger")]
    NoRoiLedger(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DepositError {
    pub fn code(&self) -> &'static str {
        match self {
            DepositError::Store(e) => e.code(),
            DepositError::Money(e) => e.code(),
            DepositError::Chain(e) => e.code(),
            DepositError::AlreadyProcessed => "ALREADY_PROCESSED",
            DepositError::IntentNotPending(_) => "INTENT_NOT_PENDING",
            DepositError::IntentNotFound(_) => "INTENT_NOT_FOUND",
            DepositError::NoRoiLedger(_) => "NO_ROI_LEDGER",
            DepositError::InvalidAmount(_) => "INVALID_AMOUNT",
            DepositError::InvalidState(_) => "INVALID_STATE",
        }
    }
}
