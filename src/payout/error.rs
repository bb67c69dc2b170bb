//! Payout error types
//!
//! [`PayoutError`] is what payout operations return to callers.
//! [`PaymentFailure`] is the classified outcome of one dispatch attempt and
//! drives the retry-vs-dead-letter decision.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::chain::ChainError;
use crate::money::MoneyError;
use crate::persistence::StoreError;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Invalid payout request: {0}")]
    InvalidRequest(String),

    #[error("Payout not found: {0}")]
    NotFound(Uuid),

    #[error("Payout {0} is not in the dead letter queue")]
    NotDeadLettered(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl PayoutError {
    pub fn code(&self) -> &'static str {
        match self {
            PayoutError::Store(e) => e.code(),
            PayoutError::Chain(e) => e.code(),
            PayoutError::Money(e) => e.code(),
            PayoutError::InvalidRequest(_) => "INVALID_PAYOUT_REQUEST",
            PayoutError::NotFound(_) => "PAYOUT_NOT_FOUND",
            PayoutError::NotDeadLettered(_) => "NOT_DEAD_LETTERED",
            PayoutError::InvalidTransition { .. } => "INVALID_TRANSITION",
            PayoutError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Classification of a failed dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Payout wallet below the native gas safety threshold
    InsufficientGas,
    /// Payout wallet lacks the token amount
    InsufficientFunds,
    Network,
    NodeRejected,
    /// Signer unavailable or misconfigured
    Signer,
    InvalidDestination,
    InvalidAmount,
    /// Mined but reverted
    Reverted,
}

impl FailureKind {
    /// Retriable failures feed the retry engine; the rest dead-letter immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FailureKind::InsufficientGas
                | FailureKind::InsufficientFunds
                | FailureKind::Network
                | FailureKind::NodeRejected
                | FailureKind::Signer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InsufficientGas => "INSUFFICIENT_GAS",
            FailureKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            FailureKind::Network => "NETWORK",
            FailureKind::NodeRejected => "NODE_REJECTED",
            FailureKind::Signer => "SIGNER",
            FailureKind::InvalidDestination => "INVALID_DESTINATION",
            FailureKind::InvalidAmount => "INVALID_AMOUNT",
            FailureKind::Reverted => "REVERTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PaymentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<ChainError> for PaymentFailure {
    fn from(e: ChainError) -> Self {
        let kind = match &e {
            ChainError::Rejected(msg) if msg.to_lowercase().contains("insufficient funds") => {
                FailureKind::InsufficientGas
            }
            ChainError::Rejected(_) | ChainError::Rpc { .. } => FailureKind::NodeRejected,
            ChainError::Signer(_) | ChainError::Config(_) => FailureKind::Signer,
            ChainError::RpcConnection(_)
            | ChainError::Timeout(_)
            | ChainError::RateLimited(_)
            | ChainError::Subscription(_)
            | ChainError::BlockNotFound(_)
            | ChainError::Parse(_)
            | ChainError::Drained => FailureKind::Network,
        };
        PaymentFailure::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_classification() {
        let f = PaymentFailure::from(ChainError::Timeout("slow".into()));
        assert_eq!(f.kind, FailureKind::Network);
        assert!(f.is_retriable());

        let f = PaymentFailure::from(ChainError::Rejected(
            "insufficient funds for gas * price + value".into(),
        ));
        assert_eq!(f.kind, FailureKind::InsufficientGas);

        let f = PaymentFailure::from(ChainError::Rejected("nonce too low".into()));
        assert_eq!(f.kind, FailureKind::NodeRejected);
        assert!(f.is_retriable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!FailureKind::InvalidDestination.is_retriable());
        assert!(!FailureKind::InvalidAmount.is_retriable());
        assert!(!FailureKind::Reverted.is_retriable());
    }

    #[test]
    fn test_failure_display() {
        let f = PaymentFailure::new(FailureKind::Network, "connection reset");
        assert_eq!(f.to_string(), "NETWORK: connection reset");
    }
}
