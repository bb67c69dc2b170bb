use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::chain::{ChainAccessConfig, RateLimitParams, RetrySettings, RpcTier};
use crate::deposit::types::{DEFAULT_ROI_CAP_MULTIPLE, DEFAULT_TOLERANCE_BPS};
use crate::deposit::{ReconcilerConfig, SweepConfig};
use crate::monitor::MonitorConfig;
use crate::payout::{DEFAULT_MAX_ATTEMPTS, DispatcherConfig, RetryEngineConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "CONFIG_IO",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::Invalid(_) => "CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Create missing tables on startup (dev/test only)
    #[serde(default)]
    pub init_schema: bool,
    pub chain: ChainConfig,
    pub deposit: DepositConfig,
    pub payout: PayoutConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub http_url: String,
    /// Subscription endpoint; polling is used when absent
    #[serde(default)]
    pub ws_url: Option<String>,
    pub chain_id: u64,
    pub token_contract: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
    #[serde(default)]
    pub rpc_tier: RpcTier,
    /// Overrides the tier's limiter parameters
    #[serde(default)]
    pub rate_limit: Option<RateLimitParams>,
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rpc_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_rpc_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DepositConfig {
    pub receiving_address: String,
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    #[serde(default = "default_tolerance_bps")]
    pub tolerance_bps: u32,
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: i64,
    #[serde(default = "default_rescan_blocks")]
    pub rescan_blocks: u64,
    #[serde(default = "default_roi_cap_multiple")]
    pub roi_cap_multiple: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PayoutConfig {
    /// Expected signer address; checked against the key at startup
    #[serde(default)]
    pub payout_address: Option<String>,
    /// `env:VAR` or `file:/path`
    pub signer: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: i64,
    #[serde(default = "default_payout_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_min_gas_balance_wei")]
    pub min_gas_balance_wei: u128,
    #[serde(default = "default_gas_price_bump_bps")]
    pub gas_price_bump_bps: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

fn default_token_decimals() -> u32 {
    6
}
fn default_log_chunk_size() -> u64 {
    2_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_rpc_max_retries() -> u32 {
    3
}
fn default_rpc_retry_base_ms() -> u64 {
    500
}
fn default_rpc_retry_max_ms() -> u64 {
    8_000
}
fn default_poll_interval_ms() -> u64 {
    4_000
}
fn default_confirmation_depth() -> u64 {
    12
}
fn default_tolerance_bps() -> u32 {
    DEFAULT_TOLERANCE_BPS
}
fn default_expiry_hours() -> i64 {
    24
}
fn default_grace_window_secs() -> i64 {
    1_800
}
fn default_rescan_blocks() -> u64 {
    64
}
fn default_roi_cap_multiple() -> i64 {
    DEFAULT_ROI_CAP_MULTIPLE
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_backoff_secs() -> i64 {
    60
}
fn default_payout_sweep_interval_secs() -> u64 {
    15
}
fn default_lease_secs() -> i64 {
    300
}
fn default_batch_size() -> usize {
    50
}
fn default_gas_limit() -> u64 {
    100_000
}
fn default_min_gas_balance_wei() -> u128 {
    10_000_000_000_000_000
}
fn default_gas_price_bump_bps() -> u32 {
    1_000
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(format!("config/{}.yaml", env))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.chain.http_url.is_empty() {
            return invalid("chain.http_url is required");
        }
        if self.chain.token_contract.is_empty() {
            return invalid("chain.token_contract is required");
        }
        if self.deposit.receiving_address.is_empty() {
            return invalid("deposit.receiving_address is required");
        }
        if self.deposit.confirmation_depth == 0 {
            return invalid("deposit.confirmation_depth must be at least 1");
        }
        if self.deposit.tolerance_bps > 10_000 {
            return invalid("deposit.tolerance_bps must not exceed 10000");
        }
        if self.payout.max_attempts == 0 {
            return invalid("payout.max_attempts must be at least 1");
        }
        if !self.payout.signer.starts_with("env:") && !self.payout.signer.starts_with("file:") {
            return invalid("payout.signer must be an env: or file: reference");
        }
        Ok(())
    }
}

impl ChainConfig {
    pub fn rate_limit_params(&self) -> RateLimitParams {
        self.rate_limit
            .clone()
            .unwrap_or_else(|| RateLimitParams::for_tier(self.rpc_tier))
    }

    pub fn access_config(&self) -> ChainAccessConfig {
        ChainAccessConfig {
            limits: self.rate_limit_params(),
            retry: RetrySettings {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
            log_chunk_size: self.log_chunk_size,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl DepositConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            confirmation_depth: self.confirmation_depth,
            rescan_blocks: self.rescan_blocks,
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..MonitorConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            roi_cap_multiple: self.roi_cap_multiple,
            grace_window: chrono::Duration::seconds(self.grace_window_secs),
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours)
    }
}

impl PayoutConfig {
    pub fn dispatcher_config(&self, chain: &ChainConfig) -> DispatcherConfig {
        DispatcherConfig {
            chain_id: chain.chain_id,
            token_contract: chain.token_contract.to_lowercase(),
            token_decimals: chain.token_decimals,
            gas_limit: self.gas_limit,
            min_gas_balance_wei: self.min_gas_balance_wei,
            gas_price_bump_bps: self.gas_price_bump_bps,
        }
    }

    pub fn retry_config(&self, confirmation_depth: u64) -> RetryEngineConfig {
        RetryEngineConfig {
            policy: RetryPolicy {
                max_attempts: self.max_attempts,
                base_backoff: chrono::Duration::seconds(self.base_backoff_secs),
            },
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            lease: chrono::Duration::seconds(self.lease_secs),
            batch_size: self.batch_size,
            confirmation_depth,
        }
    }
}
