//! Chain Access Layer
//!
//! Rate-limited, retrying access to one EVM node for a single token contract,
//! plus the unthrottled new-head subscription and the payout signer.

pub mod access;
pub mod error;
pub mod feed;
pub mod limiter;
pub mod metrics;
pub mod rpc;
pub mod signer;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use access::{ChainAccess, ChainAccessConfig, RetrySettings};
pub use error::ChainError;
pub use feed::{BlockFeed, ChainNotification, FeedHandle, PollingHeadFeed, WsHeadFeed};
pub use limiter::{RateLimitParams, RateLimiter, RpcTier};
pub use metrics::ChainMetricsSnapshot;
pub use rpc::{ChainRpc, EvmRpcClient};
pub use signer::{LocalKeySigner, PayoutSigner, SecretRef, SignedTransaction, TokenTransferTx};
pub use types::{BlockHead, ChainTransferEvent, NodeHealth, TransferKey, TxReceipt};
