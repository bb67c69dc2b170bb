//! Settlement Core - stablecoin deposit and payout settlement
//!
//! Watches a token contract for inbound transfers, credits them against
//! pending deposit intents, and pays accrued earnings back out with retry,
//! dead-lettering and operator recovery.
//!
//! # Modules
//!
//! - [`money`] - Fixed-point token amounts and tolerance arithmetic
//! - [`chain`] - Rate-limited, metered access to the node (RPC, feeds, signing)
//! - [`monitor`] - Event monitor: confirmed Transfer detection and reconnects
//! - [`deposit`] - Deposit intents, matching and the idempotent ledger credit
//! - [`payout`] - Payment dispatcher and the durable retry engine
//! - [`persistence`] - PostgreSQL and in-memory stores
//! - [`events`] - Outbound settlement events and alerts
//! - [`service`] - Orchestrator: lifecycle and inbound operations
//! - [`http`] - `/metrics` and `/health`

// Core value type - must be first!
pub mod money;

// Chain side
pub mod chain;
pub mod monitor;

// Settlement components
pub mod deposit;
pub mod events;
pub mod payout;
pub mod persistence;

// Orchestration
pub mod http;
pub mod service;

// Infrastructure
pub mod config;
pub mod db;
pub mod logging;


// Convenient re-exports at crate root
pub use chain::{ChainAccess, ChainError};
pub use deposit::{DepositIntent, DepositReconciler, IntentStatus};
pub use events::{AlertSeverity, SettlementEvent, SettlementNotifier};
pub use money::{MoneyAmount, MoneyError};
pub use payout::{PaymentDispatcher, PayoutRequest, RetryEngine, RetryState};
pub use persistence::{MemoryStore, PgSettlementStore, StoreError};
pub use service::{SettlementError, SettlementService};
