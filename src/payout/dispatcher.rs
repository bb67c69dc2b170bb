//! Payment Dispatcher
//!
//! Turns a [`PayoutRequest`] into a signed token transfer and broadcasts it.
//! Owns the payout wallet's nonce sequence; one dispatcher per wallet.

use num_traits::Zero;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{FailureKind, PaymentFailure};
use super::types::PayoutRequest;
use crate::chain::types::{is_zero_address, normalize_address};
use crate::chain::{ChainAccess, PayoutSigner, SignedTransaction, TokenTransferTx};
use crate::events::{AlertSeverity, SettlementEvent, SettlementNotifier};
use crate::money::BPS_DENOMINATOR;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub chain_id: u64,
    pub token_contract: String,
    pub token_decimals: u32,
    pub gas_limit: u64,
    /// Refuse to send below this native balance (wei)
    pub min_gas_balance_wei: u128,
    /// Added on top of the node's gas price quote
    pub gas_price_bump_bps: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            token_contract: String::new(),
            token_decimals: 6,
            gas_limit: 100_000,
            min_gas_balance_wei: 10_000_000_000_000_000,
            gas_price_bump_bps: 1_000,
        }
    }
}

/// Locally tracked nonce, lazily synced from the node's pending count.
#[derive(Debug, Default)]
struct NonceManager {
    next: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PreparedPayment {
    pub payout_id: Uuid,
    pub nonce: u64,
    pub tx: SignedTransaction,
}

pub struct PaymentDispatcher {
    access: Arc<ChainAccess>,
    signer: RwLock<Arc<dyn PayoutSigner>>,
    nonce: Mutex<NonceManager>,
    notifier: Arc<dyn SettlementNotifier>,
    config: DispatcherConfig,
}

impl PaymentDispatcher {
    pub fn new(
        access: Arc<ChainAccess>,
        signer: Arc<dyn PayoutSigner>,
        notifier: Arc<dyn SettlementNotifier>,
        config: DispatcherConfig,
    ) -> Self {
        info!(address = signer.address(), chain_id = config.chain_id, "Payment dispatcher ready");
        Self {
            access,
            signer: RwLock::new(signer),
            nonce: Mutex::new(NonceManager::default()),
            notifier,
            config,
        }
    }

    pub async fn payout_address(&self) -> String {
        self.signer.read().await.address().to_string()
    }

    /// Swap the signing key. The nonce is re-read for the new wallet.
    pub async fn reload_signer(&self, signer: Arc<dyn PayoutSigner>) {
        let mut current = self.signer.write().await;
        info!(from = current.address(), to = signer.address(), "Reloading payout signer");
        *current = signer;
        self.invalidate_nonce().await;
    }

    pub async fn invalidate_nonce(&self) {
        let mut nonce = self.nonce.lock().await;
        if nonce.next.take().is_some() {
            debug!("Nonce cache invalidated");
        }
    }

    fn alert(&self, severity: AlertSeverity, message: String) {
        self.notifier
            .publish(SettlementEvent::alert(severity, "payment_dispatcher", message));
    }

    fn bumped_gas_price(&self, quoted: u128) -> u128 {
        quoted + quoted * u128::from(self.config.gas_price_bump_bps) / u128::from(BPS_DENOMINATOR)
    }

    /// Validate, check balances, reserve a nonce and sign.
    pub async fn prepare(&self, request: &PayoutRequest) -> Result<PreparedPayment, PaymentFailure> {
        let destination = normalize_address(&request.destination)
            .map_err(|e| PaymentFailure::new(FailureKind::InvalidDestination, e.to_string()))?;
        if is_zero_address(&destination) {
            return Err(PaymentFailure::new(
                FailureKind::InvalidDestination,
                "destination is the zero address",
            ));
        }

        let units = request
            .amount
            .to_unsigned_units(self.config.token_decimals)
            .map_err(|e| PaymentFailure::new(FailureKind::InvalidAmount, e.to_string()))?;
        if units.is_zero() {
            return Err(PaymentFailure::new(
                FailureKind::InvalidAmount,
                format!("amount {} is zero at token precision", request.amount),
            ));
        }

        let signer = self.signer.read().await.clone();
        let from = signer.address().to_string();

        let gas_price = self.bumped_gas_price(self.access.gas_price().await?);
        let fee = gas_price.saturating_mul(u128::from(self.config.gas_limit));
        let threshold = fee.max(self.config.min_gas_balance_wei);
        let native = self.access.native_balance(&from).await?;
        if native < threshold {
            let message = format!(
                "payout wallet {} gas balance {} wei below threshold {} wei",
                from, native, threshold
            );
            warn!(payout_id = %request.id, native, threshold, "Refusing payout: low gas balance");
            self.alert(AlertSeverity::Critical, message.clone());
            return Err(PaymentFailure::new(FailureKind::InsufficientGas, message));
        }

        let token_balance = self.access.token_balance(&from).await?;
        if token_balance < request.amount {
            let message = format!(
                "payout wallet {} token balance {} below payout {}",
                from, token_balance, request.amount
            );
            self.alert(AlertSeverity::Warning, message.clone());
            return Err(PaymentFailure::new(FailureKind::InsufficientFunds, message));
        }

        let mut nonce_guard = self.nonce.lock().await;
        let nonce = match nonce_guard.next {
            Some(n) => n,
            None => {
                let synced = self.access.pending_nonce(&from).await?;
                debug!(nonce = synced, "Nonce synced from node");
                synced
            }
        };

        let tx = TokenTransferTx {
            nonce,
            gas_price,
            gas_limit: self.config.gas_limit,
            chain_id: self.config.chain_id,
            token_contract: self.config.token_contract.clone(),
            recipient: destination,
            amount_units: units,
        };
        match signer.sign_token_transfer(&tx) {
            Ok(signed) => {
                nonce_guard.next = Some(nonce + 1);
                debug!(payout_id = %request.id, nonce, tx_hash = %signed.tx_hash, "Payout signed");
                Ok(PreparedPayment {
                    payout_id: request.id,
                    nonce,
                    tx: signed,
                })
            }
            Err(e) => {
                nonce_guard.next = None;
                Err(e.into())
            }
        }
    }

    /// Broadcast a prepared payment; any failure drops the nonce cache.
    pub async fn broadcast(&self, prepared: &PreparedPayment) -> Result<String, PaymentFailure> {
        match self.access.send_raw_transaction(&prepared.tx.raw).await {
            Ok(hash) => {
                if hash != prepared.tx.tx_hash {
                    warn!(
                        expected = %prepared.tx.tx_hash,
                        returned = %hash,
                        "Node returned a different transaction hash"
                    );
                }
                info!(
                    payout_id = %prepared.payout_id,
                    nonce = prepared.nonce,
                    tx_hash = %prepared.tx.tx_hash,
                    "Payout broadcast"
                );
                Ok(prepared.tx.tx_hash.clone())
            }
            Err(e) => {
                self.invalidate_nonce().await;
                Err(e.into())
            }
        }
    }

    pub async fn dispatch(&self, request: &PayoutRequest) -> Result<String, PaymentFailure> {
        let prepared = self.prepare(request).await?;
        self.broadcast(&prepared).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::chain::{ChainAccessConfig, ChainError, LocalKeySigner, RateLimitParams, RetrySettings, RpcTier};
    use crate::events::testing::RecordingNotifier;
    use crate::money::MoneyAmount;
    use crate::payout::types::PayoutStatus;
    use chrono::Utc;
    use std::time::Duration;

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";

    fn setup() -> (Arc<MockChain>, Arc<RecordingNotifier>, PaymentDispatcher) {
        let chain = Arc::new(MockChain::new());
        let access = Arc::new(
            ChainAccess::new(
                chain.clone(),
                ChainAccessConfig {
                    limits: RateLimitParams::for_tier(RpcTier::Enterprise),
                    retry: RetrySettings {
                        max_retries: 0,
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(1),
                    },
                    log_chunk_size: 100,
                },
            )
            .unwrap(),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = PaymentDispatcher::new(
            access,
            Arc::new(LocalKeySigner::from_hex(TEST_KEY).unwrap()),
            notifier.clone(),
            DispatcherConfig {
                token_contract: TOKEN.into(),
                ..DispatcherConfig::default()
            },
        );
        (chain, notifier, dispatcher)
    }

    fn request(destination: &str, amount: &str) -> PayoutRequest {
        PayoutRequest {
            id: Uuid::new_v4(),
            destination: destination.into(),
            amount: MoneyAmount::parse(amount).unwrap(),
            source_refs: vec![],
            status: PayoutStatus::Queued,
            created_at: Utc::now(),
        }
    }

    const DEST: &str = "0x3333333333333333333333333333333333333333";

    #[tokio::test]
    async fn test_dispatch_uses_sequential_nonces() {
        let (chain, _, dispatcher) = setup();
        let first = dispatcher.prepare(&request(DEST, "12.5")).await.unwrap();
        let second = dispatcher.prepare(&request(DEST, "1")).await.unwrap();
        assert_eq!(first.nonce, 0);
        assert_eq!(second.nonce, 1);

        let hash = dispatcher.broadcast(&first).await.unwrap();
        assert_eq!(chain.sent(), vec![hash]);
    }

    #[tokio::test]
    async fn test_low_gas_refuses_and_alerts() {
        let (chain, notifier, dispatcher) = setup();
        chain.set_native_balance(1_000);

        let err = dispatcher.dispatch(&request(DEST, "5")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InsufficientGas);
        assert!(err.is_retriable());
        assert!(chain.sent().is_empty());
        assert_eq!(notifier.count("alert"), 1);
    }

    #[tokio::test]
    async fn test_invalid_destination_is_terminal() {
        let (_, _, dispatcher) = setup();
        let err = dispatcher.dispatch(&request("not-an-address", "5")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidDestination);
        assert!(!err.is_retriable());

        let zero = "0x0000000000000000000000000000000000000000";
        let err = dispatcher.dispatch(&request(zero, "5")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidDestination);
    }

    #[tokio::test]
    async fn test_dust_amount_is_invalid() {
        let (_, _, dispatcher) = setup();
        // below 6-decimal token precision
        let err = dispatcher.dispatch(&request(DEST, "0.0000001")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidAmount);
    }

    #[tokio::test]
    async fn test_insufficient_token_balance() {
        let (chain, _, dispatcher) = setup();
        chain.set_token_balance(MoneyAmount::from_whole(1));
        let err = dispatcher.dispatch(&request(DEST, "2")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InsufficientFunds);
    }

    #[tokio::test]
    async fn test_broadcast_failure_resyncs_nonce() {
        let (chain, _, dispatcher) = setup();
        chain.fail_next_send(ChainError::Rejected("nonce too low".into()));

        let err = dispatcher.dispatch(&request(DEST, "1")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::NodeRejected);

        // the node never accepted nonce 0, so it is reused after resync
        let prepared = dispatcher.prepare(&request(DEST, "1")).await.unwrap();
        assert_eq!(prepared.nonce, 0);
    }

    #[tokio::test]
    async fn test_network_error_during_preparation() {
        let (chain, _, dispatcher) = setup();
        chain.fail_next(ChainError::Timeout("gas price".into()));
        let err = dispatcher.dispatch(&request(DEST, "1")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Network);
    }
}
