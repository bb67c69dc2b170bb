//! Deposit Reconciler
//!
//! Intents, matching, exactly-once confirmation, ROI caps and the expiry sweep.

pub mod reconciler;
pub mod store;
pub mod types;
pub mod worker;

pub use reconciler::{DepositReconciler, ReconcilerConfig, select_match};
pub use store::DepositStore;
pub use types::{
    DepositError, DepositIntent, IntentStatus, NewDepositIntent, ProductKind, ReconcileOutcome,
    RoiApplication, RoiLedger,
};
pub use worker::{DepositSweeper, SweepConfig, SweepReport};
