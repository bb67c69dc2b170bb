//! Payouts
//!
//! [`PaymentDispatcher`] signs and broadcasts one transfer; [`RetryEngine`]
//! owns the retry state machine around it.

pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod store;
pub mod types;

pub use dispatcher::{DispatcherConfig, PaymentDispatcher, PreparedPayment};
pub use error::{FailureKind, PaymentFailure, PayoutError};
pub use retry::{FollowUpSummary, RetryEngine, RetryEngineConfig, SweepSummary};
pub use store::{AuditAction, AuditEntry, PayoutStore, SentPayout};
pub use types::{
    DEFAULT_MAX_ATTEMPTS, EarningRecord, FailureDisposition, PayoutBatch, PayoutRequest,
    PayoutStatus, RetryPolicy, RetryRecord, RetryState, batch_earnings,
};
