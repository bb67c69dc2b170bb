//! Durable storage for deposits and payouts.
//!
//! [`PgSettlementStore`] is the production implementation; [`MemoryStore`]
//! implements the same traits behind one async mutex for tests and dry runs.

pub mod memory;
pub mod postgres;
pub mod schema;

use thiserror::Error;

use crate::money::MoneyError;

pub use memory::MemoryStore;
pub use postgres::PgSettlementStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness guard fired (e.g. a transfer key already processed)
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// The row is no longer in the state the operation requires
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    /// A stored value could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Duplicate(_) => "DUPLICATE",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::Money(e) => e.code(),
            StoreError::Corrupt(_) => "CORRUPT_ROW",
        }
    }
}
