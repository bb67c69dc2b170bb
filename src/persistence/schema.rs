//! PostgreSQL DDL.
//!
//! Money columns are `NUMERIC(38, 8)`; retry states are SMALLINT ids of
//! [`crate::payout::RetryState`].

use sqlx::PgPool;

use super::StoreError;

pub const CREATE_DEPOSIT_INTENTS: &str = r#"
CREATE TABLE IF NOT EXISTS deposit_intents (
    id                UUID PRIMARY KEY,
    owner             VARCHAR(128) NOT NULL,
    expected_amount   NUMERIC(38, 8) NOT NULL,
    receiving_address VARCHAR(42) NOT NULL,
    tolerance_bps     INTEGER NOT NULL,
    product           VARCHAR(16) NOT NULL,
    status            VARCHAR(16) NOT NULL,
    actual_amount     NUMERIC(38, 8),
    confirming_tx     VARCHAR(66),
    confirming_block  BIGINT,
    created_at        TIMESTAMPTZ NOT NULL,
    expires_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_DEPOSIT_INTENTS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deposit_intents_pending
    ON deposit_intents (receiving_address, created_at)
    WHERE status = 'PENDING'"#;

pub const CREATE_PROCESSED_TRANSFERS: &str = r#"
CREATE TABLE IF NOT EXISTS processed_transfers (
    tx_hash      VARCHAR(66) NOT NULL,
    log_index    BIGINT NOT NULL,
    intent_id    UUID NOT NULL REFERENCES deposit_intents (id),
    block_number BIGINT NOT NULL,
    from_address VARCHAR(42) NOT NULL,
    amount       NUMERIC(38, 8) NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tx_hash, log_index)
)"#;

pub const CREATE_USER_BALANCES: &str = r#"
CREATE TABLE IF NOT EXISTS user_balances (
    owner      VARCHAR(128) PRIMARY KEY,
    available  NUMERIC(38, 8) NOT NULL DEFAULT 0,
    version    BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_LEDGER_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR(128) NOT NULL,
    intent_id  UUID REFERENCES deposit_intents (id),
    kind       VARCHAR(32) NOT NULL,
    amount     NUMERIC(38, 8) NOT NULL,
    tx_hash    VARCHAR(66),
    created_at TIMESTAMPTZ NOT NULL
)"#;

pub const CREATE_ROI_LEDGERS: &str = r#"
CREATE TABLE IF NOT EXISTS roi_ledgers (
    intent_id    UUID PRIMARY KEY REFERENCES deposit_intents (id),
    cap_amount   NUMERIC(38, 8) NOT NULL,
    paid_amount  NUMERIC(38, 8) NOT NULL DEFAULT 0,
    completed    BOOLEAN NOT NULL DEFAULT FALSE,
    completed_at TIMESTAMPTZ,
    CHECK (paid_amount <= cap_amount)
)"#;

pub const CREATE_EARNINGS: &str = r#"
CREATE TABLE IF NOT EXISTS earnings (
    id          UUID PRIMARY KEY,
    destination VARCHAR(42) NOT NULL,
    amount      NUMERIC(38, 8) NOT NULL,
    paid        BOOLEAN NOT NULL DEFAULT FALSE,
    paid_at     TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_PAYOUT_REQUESTS: &str = r#"
CREATE TABLE IF NOT EXISTS payout_requests (
    id          UUID PRIMARY KEY,
    destination VARCHAR(42) NOT NULL,
    amount      NUMERIC(38, 8) NOT NULL,
    status      VARCHAR(16) NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_PAYOUT_EARNINGS: &str = r#"
CREATE TABLE IF NOT EXISTS payout_earnings (
    earning_id        UUID PRIMARY KEY,
    payout_request_id UUID NOT NULL REFERENCES payout_requests (id)
)"#;

pub const CREATE_RETRY_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS retry_records (
    payout_request_id UUID PRIMARY KEY REFERENCES payout_requests (id),
    state             SMALLINT NOT NULL,
    attempt_count     INTEGER NOT NULL DEFAULT 0,
    max_attempts      INTEGER NOT NULL,
    last_error        TEXT,
    next_retry_at     TIMESTAMPTZ,
    in_dead_letter    BOOLEAN NOT NULL DEFAULT FALSE,
    resolved          BOOLEAN NOT NULL DEFAULT FALSE,
    last_tx_hash      VARCHAR(66),
    lease_until       TIMESTAMPTZ,
    updated_at        TIMESTAMPTZ NOT NULL,
    CHECK (NOT (in_dead_letter AND resolved))
)"#;

pub const CREATE_RETRY_RECORDS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_retry_records_due
    ON retry_records (next_retry_at)
    WHERE next_retry_at IS NOT NULL"#;

pub const CREATE_PAYOUT_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS payout_transactions (
    payout_request_id UUID PRIMARY KEY REFERENCES payout_requests (id),
    tx_hash           VARCHAR(66) NOT NULL,
    amount            NUMERIC(38, 8) NOT NULL,
    destination       VARCHAR(42) NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL
)"#;

pub const CREATE_OPERATOR_AUDIT: &str = r#"
CREATE TABLE IF NOT EXISTS operator_audit (
    id                BIGSERIAL PRIMARY KEY,
    payout_request_id UUID NOT NULL REFERENCES payout_requests (id),
    operator          VARCHAR(128) NOT NULL,
    action            VARCHAR(32) NOT NULL,
    note              TEXT,
    created_at        TIMESTAMPTZ NOT NULL
)"#;

/// Statements in dependency order
pub const ALL_TABLES: &[(&str, &str)] = &[
    ("deposit_intents", CREATE_DEPOSIT_INTENTS),
    ("idx_deposit_intents_pending", CREATE_DEPOSIT_INTENTS_INDEX),
    ("processed_transfers", CREATE_PROCESSED_TRANSFERS),
    ("user_balances", CREATE_USER_BALANCES),
    ("ledger_entries", CREATE_LEDGER_ENTRIES),
    ("roi_ledgers", CREATE_ROI_LEDGERS),
    ("earnings", CREATE_EARNINGS),
    ("payout_requests", CREATE_PAYOUT_REQUESTS),
    ("payout_earnings", CREATE_PAYOUT_EARNINGS),
    ("retry_records", CREATE_RETRY_RECORDS),
    ("idx_retry_records_due", CREATE_RETRY_RECORDS_INDEX),
    ("payout_transactions", CREATE_PAYOUT_TRANSACTIONS),
    ("operator_audit", CREATE_OPERATOR_AUDIT),
];

/// Create all settlement tables if missing.
pub async fn init_schema(pool: &PgPool) -> Result<(), StoreError> {
    tracing::info!("Initializing settlement schema...");
    for (name, ddl) in ALL_TABLES {
        sqlx::query(ddl).execute(pool).await?;
        tracing::debug!(object = name, "Schema object ready");
    }
    tracing::info!("Settlement schema initialized");
    Ok(())
}
