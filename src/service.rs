//! Settlement Service
//!
//! Wires the chain access layer, event monitor, deposit reconciler, payment
//! dispatcher and retry engine into one unit with an explicit start/stop
//! lifecycle, and exposes the inbound operations collaborators call.
//!
//! ```text
//! chain ──feed──▶ EventMonitor ──confirmed──▶ DepositReconciler ──▶ ledger
//! ledger ──enqueue──▶ RetryEngine ──▶ PaymentDispatcher ──▶ chain
//! ```

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::types::{is_zero_address, normalize_address};
use crate::chain::{
    BlockFeed, ChainAccess, ChainError, ChainMetricsSnapshot, EvmRpcClient, LocalKeySigner,
    NodeHealth, PayoutSigner, PollingHeadFeed, SecretRef, WsHeadFeed,
};
use crate::config::{AppConfig, ConfigError};
use crate::deposit::types::DEFAULT_TOLERANCE_BPS;
use crate::deposit::{
    DepositError, DepositIntent, DepositReconciler, DepositStore, DepositSweeper,
    NewDepositIntent, ReconcilerConfig, RoiApplication, SweepConfig,
};
use crate::events::SettlementNotifier;
use crate::money::{BPS_DENOMINATOR, MoneyAmount};
use crate::monitor::{EventMonitor, MonitorConfig, MonitorError, MonitorHandle, MonitorState};
use crate::payout::{
    AuditEntry, DispatcherConfig, EarningRecord, PaymentDispatcher, PayoutError, PayoutRequest,
    PayoutStore, RetryEngine, RetryEngineConfig, RetryRecord,
};
use crate::persistence::StoreError;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Deposit(#[from] DepositError),

    #[error(transparent)]
    Payout(#[from] PayoutError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::Chain(e) => e.code(),
            SettlementError::Monitor(e) => e.code(),
            SettlementError::Deposit(e) => e.code(),
            SettlementError::Payout(e) => e.code(),
            SettlementError::Store(e) => e.code(),
            SettlementError::Config(e) => e.code(),
            SettlementError::InvalidInput(_) => "INVALID_INPUT",
            SettlementError::AlreadyRunning => "ALREADY_RUNNING",
            SettlementError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Constructed collaborators the service owns
pub struct SettlementComponents {
    pub access: Arc<ChainAccess>,
    pub feed: Arc<dyn BlockFeed>,
    pub deposit_store: Arc<dyn DepositStore>,
    pub payout_store: Arc<dyn PayoutStore>,
    pub signer: Arc<dyn PayoutSigner>,
    pub notifier: Arc<dyn SettlementNotifier>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub receiving_address: String,
    pub default_tolerance_bps: u32,
    pub deposit_expiry: chrono::Duration,
    pub monitor: MonitorConfig,
    pub reconciler: ReconcilerConfig,
    pub sweep: SweepConfig,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryEngineConfig,
}

impl ServiceConfig {
    pub fn new(receiving_address: &str) -> Self {
        Self {
            receiving_address: receiving_address.to_string(),
            default_tolerance_bps: DEFAULT_TOLERANCE_BPS,
            deposit_expiry: chrono::Duration::hours(24),
            monitor: MonitorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            sweep: SweepConfig::default(),
            dispatcher: DispatcherConfig::default(),
            retry: RetryEngineConfig::default(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            receiving_address: config.deposit.receiving_address.clone(),
            default_tolerance_bps: config.deposit.tolerance_bps,
            deposit_expiry: config.deposit.expiry(),
            monitor: config.deposit.monitor_config(),
            reconciler: config.deposit.reconciler_config(),
            sweep: config.deposit.sweep_config(),
            dispatcher: config.payout.dispatcher_config(&config.chain),
            retry: config
                .payout
                .retry_config(config.deposit.confirmation_depth),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub running: bool,
    pub monitor: MonitorState,
    pub receiving_address: String,
    pub payout_address: String,
    pub node: Option<NodeHealth>,
    pub node_error: Option<String>,
    pub rpc_queue_depth: usize,
    pub unmatched_transfers: usize,
}

struct Runtime {
    monitor: MonitorHandle,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

pub struct SettlementService {
    access: Arc<ChainAccess>,
    feed: Arc<dyn BlockFeed>,
    deposit_store: Arc<dyn DepositStore>,
    notifier: Arc<dyn SettlementNotifier>,
    reconciler: Arc<DepositReconciler>,
    sweeper: Arc<DepositSweeper>,
    dispatcher: Arc<PaymentDispatcher>,
    retry: Arc<RetryEngine>,
    config: ServiceConfig,
    receiving_address: RwLock<String>,
    runtime: Mutex<Option<Runtime>>,
    accepting: AtomicBool,
}

impl SettlementService {
    pub fn new(
        components: SettlementComponents,
        config: ServiceConfig,
    ) -> Result<Self, SettlementError> {
        let receiving_address = normalize_address(&config.receiving_address)?;
        let reconciler = Arc::new(DepositReconciler::new(
            components.deposit_store.clone(),
            components.notifier.clone(),
            config.reconciler.clone(),
        ));
        let sweeper = Arc::new(DepositSweeper::new(
            components.deposit_store.clone(),
            reconciler.clone(),
            config.sweep.clone(),
        ));
        let dispatcher = Arc::new(PaymentDispatcher::new(
            components.access.clone(),
            components.signer,
            components.notifier.clone(),
            config.dispatcher.clone(),
        ));
        let retry = Arc::new(RetryEngine::new(
            components.payout_store,
            dispatcher.clone(),
            components.access.clone(),
            components.notifier.clone(),
            config.retry.clone(),
        ));

        Ok(Self {
            access: components.access,
            feed: components.feed,
            deposit_store: components.deposit_store,
            notifier: components.notifier,
            reconciler,
            sweeper,
            dispatcher,
            retry,
            config,
            receiving_address: RwLock::new(receiving_address),
            runtime: Mutex::new(None),
            accepting: AtomicBool::new(true),
        })
    }

    /// Build the node client, subscription feed and signer from configuration.
    pub fn from_app_config(
        config: &AppConfig,
        deposit_store: Arc<dyn DepositStore>,
        payout_store: Arc<dyn PayoutStore>,
        notifier: Arc<dyn SettlementNotifier>,
    ) -> Result<Self, SettlementError> {
        let chain = &config.chain;
        let rpc = Arc::new(EvmRpcClient::new(
            &chain.http_url,
            &chain.token_contract,
            chain.token_decimals,
            chain.request_timeout(),
        )?);
        let access = Arc::new(ChainAccess::new(rpc, chain.access_config())?);

        let feed: Arc<dyn BlockFeed> = match &chain.ws_url {
            Some(url) => Arc::new(WsHeadFeed::new(url)),
            None => {
                warn!("No websocket endpoint configured, falling back to head polling");
                Arc::new(PollingHeadFeed::new(access.clone(), chain.poll_interval()))
            }
        };

        let secret = SecretRef::parse(&config.payout.signer)?;
        let signer = Arc::new(LocalKeySigner::from_secret(&secret)?);
        if let Some(expected) = &config.payout.payout_address {
            let expected = normalize_address(expected)?;
            if expected != signer.address() {
                return Err(ConfigError::Invalid(format!(
                    "payout.payout_address {} does not match signer address {}",
                    expected,
                    signer.address()
                ))
                .into());
            }
        }

        info!(
            chain_id = chain.chain_id,
            tier = ?chain.rpc_tier,
            feed = feed.name(),
            "Chain access configured"
        );
        Self::new(
            SettlementComponents {
                access,
                feed,
                deposit_store,
                payout_store,
                signer,
                notifier,
            },
            ServiceConfig::from_app_config(config),
        )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the event monitor, deposit sweep and retry engine.
    pub async fn start(&self) -> Result<(), SettlementError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SettlementError::ShuttingDown);
        }
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(SettlementError::AlreadyRunning);
        }

        let address = self.receiving_address.read().await.clone();
        let monitor = EventMonitor::new(
            self.access.clone(),
            self.feed.clone(),
            self.reconciler.clone(),
            self.notifier.clone(),
            &address,
            self.config.monitor.clone(),
        )?
        .spawn();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = self.sweeper.clone();
        let sweep_rx = shutdown_rx.clone();
        let retry = self.retry.clone();
        let workers = vec![
            tokio::spawn(async move { sweeper.run(sweep_rx).await }),
            tokio::spawn(async move { retry.run(shutdown_rx).await }),
        ];

        let payout_address = self.dispatcher.payout_address().await;
        info!(
            receiving_address = %address,
            payout_address = %payout_address,
            "Settlement service started"
        );
        *runtime = Some(Runtime {
            monitor,
            shutdown,
            workers,
        });
        Ok(())
    }

    /// Stop accepting new work and let in-flight sweeps finish.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.retry.close();

        let runtime = self.runtime.lock().await.take();
        let Some(runtime) = runtime else {
            return;
        };
        info!("Stopping settlement service");
        runtime.monitor.stop().await;
        let _ = runtime.shutdown.send(true);
        for worker in runtime.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Settlement service stopped");
    }

    /// Fail queued chain requests immediately, then stop.
    pub async fn emergency_stop(&self) {
        warn!("Emergency stop: draining chain request queue");
        self.access.drain();
        self.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    fn ensure_accepting(&self) -> Result<(), SettlementError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SettlementError::ShuttingDown)
        }
    }

    // ========================================================================
    // Deposits
    // ========================================================================

    pub async fn create_deposit_intent(
        &self,
        owner: &str,
        expected_amount: MoneyAmount,
        receiving_address: &str,
        tolerance_bps: Option<u32>,
    ) -> Result<DepositIntent, SettlementError> {
        self.create_deposit(NewDepositIntent {
            owner: owner.to_string(),
            expected_amount,
            receiving_address: receiving_address.to_string(),
            tolerance_bps,
            product: Default::default(),
        })
        .await
    }

    /// Create a PENDING intent for any product kind; capped-return intents
    /// also get an ROI ledger once confirmed.
    pub async fn create_deposit(
        &self,
        mut input: NewDepositIntent,
    ) -> Result<DepositIntent, SettlementError> {
        self.ensure_accepting()?;
        if input.owner.trim().is_empty() {
            return Err(SettlementError::InvalidInput("owner is empty".into()));
        }
        if !input.expected_amount.is_positive() {
            return Err(SettlementError::InvalidInput(format!(
                "expected amount must be positive, got {}",
                input.expected_amount
            )));
        }
        if input.tolerance_bps.is_some_and(|bps| bps > BPS_DENOMINATOR) {
            return Err(SettlementError::InvalidInput(
                "tolerance_bps must not exceed 10000".into(),
            ));
        }
        input.receiving_address = normalize_address(&input.receiving_address)?;
        if is_zero_address(&input.receiving_address) {
            return Err(SettlementError::InvalidInput(
                "receiving address is the zero address".into(),
            ));
        }

        let watched = self.receiving_address.read().await.clone();
        if input.receiving_address != watched {
            warn!(
                intent_address = %input.receiving_address,
                watched = %watched,
                "Deposit intent targets an address that is not being watched"
            );
        }

        let intent = DepositIntent::new(
            input,
            self.config.default_tolerance_bps,
            self.config.deposit_expiry,
            Utc::now(),
        );
        self.deposit_store.insert_intent(&intent).await?;
        info!(
            intent_id = %intent.id,
            owner = %intent.owner,
            expected = %intent.expected_amount,
            tolerance_bps = intent.tolerance_bps,
            expires_at = %intent.expires_at,
            "Deposit intent created"
        );
        Ok(intent)
    }

    /// Apply an ROI payment against a capped-return deposit's cap.
    pub async fn apply_roi_payment(
        &self,
        intent_id: Uuid,
        proposed: &MoneyAmount,
    ) -> Result<RoiApplication, SettlementError> {
        if !proposed.is_positive() {
            return Err(SettlementError::InvalidInput(format!(
                "ROI payment must be positive, got {}",
                proposed
            )));
        }
        let application = self
            .deposit_store
            .apply_roi_payment(intent_id, proposed, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => DepositError::NoRoiLedger(intent_id),
                other => DepositError::Store(other),
            })?;
        if application.just_completed {
            info!(intent_id = %intent_id, paid = %application.paid_amount, "ROI cap reached");
        }
        Ok(application)
    }

    // ========================================================================
    // Payouts
    // ========================================================================

    pub async fn enqueue_payout(
        &self,
        destination: &str,
        amount: MoneyAmount,
        source_earning_ids: Vec<Uuid>,
    ) -> Result<PayoutRequest, SettlementError> {
        self.ensure_accepting()?;
        Ok(self
            .retry
            .enqueue_payout(destination, amount, source_earning_ids, Utc::now())
            .await?)
    }

    /// Queue accrued earnings, one payout per destination.
    pub async fn enqueue_earnings(
        &self,
        earnings: &[EarningRecord],
    ) -> Result<Vec<PayoutRequest>, SettlementError> {
        self.ensure_accepting()?;
        Ok(self.retry.enqueue_earnings(earnings, Utc::now()).await?)
    }

    pub async fn operator_retry(
        &self,
        payout_id: Uuid,
        operator: &str,
    ) -> Result<RetryRecord, SettlementError> {
        Ok(self
            .retry
            .operator_retry(payout_id, operator, Utc::now())
            .await?)
    }

    pub async fn manual_resolve(
        &self,
        payout_id: Uuid,
        operator: &str,
        tx_hash: &str,
        note: Option<&str>,
    ) -> Result<RetryRecord, SettlementError> {
        Ok(self
            .retry
            .manual_resolve(payout_id, operator, tx_hash, note, Utc::now())
            .await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<RetryRecord>, SettlementError> {
        Ok(self.retry.dead_letters().await?)
    }

    pub async fn audit_trail(&self, payout_id: Uuid) -> Result<Vec<AuditEntry>, SettlementError> {
        Ok(self.retry.audit_trail(payout_id).await?)
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Point the monitor at a new receiving address and rescan.
    pub async fn reconfigure_receiving_address(
        &self,
        new_address: &str,
    ) -> Result<(), SettlementError> {
        let address = normalize_address(new_address)?;
        if is_zero_address(&address) {
            return Err(SettlementError::InvalidInput(
                "receiving address is the zero address".into(),
            ));
        }
        // the monitor must accept the new address before intents are issued against it
        let runtime = self.runtime.lock().await;
        if let Some(runtime) = runtime.as_ref() {
            runtime.monitor.rotate_address(&address).await?;
        }
        let previous = {
            let mut current = self.receiving_address.write().await;
            std::mem::replace(&mut *current, address.clone())
        };
        warn!(from = %previous, to = %address, "Receiving address rotated");
        Ok(())
    }

    /// Load a new payout key from a secret reference (`env:` / `file:`).
    pub async fn reconfigure_payout_signer(&self, secret_ref: &str) -> Result<(), SettlementError> {
        let secret = SecretRef::parse(secret_ref)?;
        let signer = LocalKeySigner::from_secret(&secret)?;
        self.dispatcher.reload_signer(Arc::new(signer)).await;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn receiving_address(&self) -> String {
        self.receiving_address.read().await.clone()
    }

    pub async fn payout_address(&self) -> String {
        self.dispatcher.payout_address().await
    }

    pub fn chain_metrics(&self) -> ChainMetricsSnapshot {
        self.access.metrics_snapshot()
    }

    /// Text exposition format for scraping
    pub fn chain_metrics_text(&self) -> Result<String, SettlementError> {
        Ok(self.access.metrics_text()?)
    }

    pub async fn health(&self) -> ServiceHealth {
        let (node, node_error) = match self.access.health().await {
            Ok(node) => (Some(node), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let monitor = match self.runtime.lock().await.as_ref() {
            Some(runtime) => runtime.monitor.state(),
            None => MonitorState::Stopped,
        };
        ServiceHealth {
            running: monitor.is_active(),
            monitor,
            receiving_address: self.receiving_address().await,
            payout_address: self.payout_address().await,
            node,
            node_error,
            rpc_queue_depth: self.access.queue_depth(),
            unmatched_transfers: self.reconciler.unmatched_count().await,
        }
    }

    pub fn reconciler(&self) -> &Arc<DepositReconciler> {
        &self.reconciler
    }

    pub fn retry_engine(&self) -> &Arc<RetryEngine> {
        &self.retry
    }
}
