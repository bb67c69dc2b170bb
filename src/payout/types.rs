use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::error::{PaymentFailure, PayoutError};
use crate::money::MoneyAmount;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Queued,
    Sent,
    Confirmed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Queued => "QUEUED",
            PayoutStatus::Sent => "SENT",
            PayoutStatus::Confirmed => "CONFIRMED",
            PayoutStatus::Failed => "FAILED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(PayoutStatus::Queued),
            "SENT" => Some(PayoutStatus::Sent),
            "CONFIRMED" => Some(PayoutStatus::Confirmed),
            "FAILED" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub destination: String,
    pub amount: MoneyAmount,
    /// Earning records this payout settles
    pub source_refs: Vec<Uuid>,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
}

/// An accrued earning awaiting payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EarningRecord {
    pub id: Uuid,
    pub destination: String,
    pub amount: MoneyAmount,
}

/// Retry FSM states
///
/// State IDs are stored as SMALLINT. Terminal: RESOLVED (40). DEAD_LETTER (-10)
/// only leaves through an operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i16)]
pub enum RetryState {
    Queued = 0,
    Retrying = 10,
    Resolved = 40,
    DeadLetter = -10,
}

impl RetryState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RetryState::Queued),
            10 => Some(RetryState::Retrying),
            40 => Some(RetryState::Resolved),
            -10 => Some(RetryState::DeadLetter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryState::Queued => "QUEUED",
            RetryState::Retrying => "RETRYING",
            RetryState::Resolved => "RESOLVED",
            RetryState::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Not picked up by sweeps
    #[inline]
    pub fn is_parked(&self) -> bool {
        matches!(self, RetryState::Resolved | RetryState::DeadLetter)
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::seconds(60),
        }
    }
}

impl RetryPolicy {
    /// Delay scheduled after the `attempt`-th failure: `base * 2^(attempt - 1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1i32
            .checked_shl(attempt.saturating_sub(1).min(30))
            .unwrap_or(i32::MAX);
        self.base_backoff * factor
    }
}

/// What a failure did to the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Scheduled { next_retry_at: DateTime<Utc> },
    DeadLettered,
}

/// Retry bookkeeping for one payout.
///
/// `in_dead_letter` and `resolved` are never both true; `next_retry_at` is
/// `None` whenever the record is parked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub payout_request_id: Uuid,
    pub state: RetryState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub in_dead_letter: bool,
    pub resolved: bool,
    /// Signed transaction recorded before broadcast
    pub last_tx_hash: Option<String>,
    /// Claimed by a sweep until this instant
    pub lease_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(payout_request_id: Uuid, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            payout_request_id,
            state: RetryState::Queued,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            next_retry_at: Some(now),
            in_dead_letter: false,
            resolved: false,
            last_tx_hash: None,
            lease_until: None,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_parked()
            && self.next_retry_at.is_some_and(|at| at <= now)
            && self.lease_until.is_none_or(|lease| lease <= now)
    }

    pub fn apply_failure(
        &mut self,
        failure: &PaymentFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, PayoutError> {
        if self.state.is_parked() {
            return Err(self.invalid(RetryState::Retrying));
        }

        self.attempt_count += 1;
        self.last_error = Some(failure.to_string());
        self.lease_until = None;
        self.updated_at = now;

        if !failure.is_retriable() || self.attempt_count >= self.max_attempts {
            self.state = RetryState::DeadLetter;
            self.in_dead_letter = true;
            self.next_retry_at = None;
            return Ok(FailureDisposition::DeadLettered);
        }

        let next = now + policy.delay_for(self.attempt_count);
        self.state = RetryState::Retrying;
        self.next_retry_at = Some(next);
        Ok(FailureDisposition::Scheduled {
            next_retry_at: next,
        })
    }

    pub fn mark_resolved(&mut self, tx_hash: &str, now: DateTime<Utc>) -> Result<(), PayoutError> {
        if self.state.is_parked() && self.state != RetryState::DeadLetter {
            return Err(self.invalid(RetryState::Resolved));
        }
        self.state = RetryState::Resolved;
        self.resolved = true;
        self.in_dead_letter = false;
        self.next_retry_at = None;
        self.lease_until = None;
        self.last_tx_hash = Some(tx_hash.to_lowercase());
        self.updated_at = now;
        Ok(())
    }

    /// Operator retry: DEAD_LETTER -> RETRYING with the attempt count reset.
    pub fn reset_for_operator(&mut self, now: DateTime<Utc>) -> Result<(), PayoutError> {
        if self.state != RetryState::DeadLetter {
            return Err(PayoutError::NotDeadLettered(self.payout_request_id));
        }
        self.state = RetryState::Retrying;
        self.attempt_count = 0;
        self.in_dead_letter = false;
        self.next_retry_at = Some(now);
        self.lease_until = None;
        self.updated_at = now;
        Ok(())
    }

    fn invalid(&self, to: RetryState) -> PayoutError {
        PayoutError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

/// Earnings grouped for one outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutBatch {
    pub destination: String,
    pub amount: MoneyAmount,
    pub earning_ids: Vec<Uuid>,
}

/// One batch per destination (case-insensitive), ordered by destination.
pub fn batch_earnings(earnings: &[EarningRecord]) -> Vec<PayoutBatch> {
    let mut batches: BTreeMap<String, PayoutBatch> = BTreeMap::new();
    for earning in earnings {
        let destination = earning.destination.to_lowercase();
        let batch = batches
            .entry(destination.clone())
            .or_insert_with(|| PayoutBatch {
                destination,
                amount: MoneyAmount::zero(),
                earning_ids: Vec::new(),
            });
        batch.amount = batch.amount.add(&earning.amount);
        batch.earning_ids.push(earning.id);
    }
    batches.into_values().collect()
}
