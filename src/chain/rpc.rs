//! Node RPC
//!
//! [`ChainRpc`] is the raw, unthrottled node interface. Production code reaches
//! it through [`super::access::ChainAccess`], which adds rate limiting, retries
//! and metrics. [`EvmRpcClient`] implements it over HTTP JSON-RPC for an
//! ERC-20 style token.

use async_trait::async_trait;
use num_bigint::{BigInt, BigUint};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::error::ChainError;
use super::types::{
    BlockHead, ChainTransferEvent, TRANSFER_TOPIC, TxReceipt, address_to_topic,
    normalize_address, parse_hex_u64, parse_hex_u128, topic_to_address,
};
use crate::money::MoneyAmount;

/// Method labels used for metrics and logging
pub mod methods {
    pub const BLOCK_NUMBER: &str = "eth_blockNumber";
    pub const GET_BLOCK: &str = "eth_getBlockByNumber";
    pub const GET_LOGS: &str = "eth_getLogs";
    pub const TOKEN_BALANCE: &str = "eth_call";
    pub const NATIVE_BALANCE: &str = "eth_getBalance";
    pub const NONCE: &str = "eth_getTransactionCount";
    pub const GAS_PRICE: &str = "eth_gasPrice";
    pub const RECEIPT: &str = "eth_getTransactionReceipt";
    pub const GET_TX: &str = "eth_getTransactionByHash";
    pub const SEND_RAW: &str = "eth_sendRawTransaction";

    pub const ALL: &[&str] = &[
        BLOCK_NUMBER,
        GET_BLOCK,
        GET_LOGS,
        TOKEN_BALANCE,
        NATIVE_BALANCE,
        NONCE,
        GAS_PRICE,
        RECEIPT,
        GET_TX,
        SEND_RAW,
    ];
}

/// Raw node operations for the single watched token.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Latest block height
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Header of a canonical block, `None` if the node does not have it
    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHead>, ChainError>;

    /// Token transfers to `to` in `[from_block, to_block]`
    async fn transfer_logs(
        &self,
        to: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainTransferEvent>, ChainError>;

    /// Token balance of `owner`
    async fn token_balance(&self, owner: &str) -> Result<MoneyAmount, ChainError>;

    /// Native gas-asset balance of `owner` in wei
    async fn native_balance(&self, owner: &str) -> Result<u128, ChainError>;

    /// Next nonce including pending transactions
    async fn pending_nonce(&self, owner: &str) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError>;

    /// Whether the node knows the transaction (mined or in its mempool)
    async fn transaction_known(&self, tx_hash: &str) -> Result<bool, ChainError>;

    /// Broadcast a signed transaction, returning its hash
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ChainError>;
}

// ============================================================================
// HTTP JSON-RPC implementation
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    block_number: String,
    block_hash: String,
    transaction_hash: String,
    log_index: String,
    #[serde(default)]
    removed: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

/// JSON-RPC client bound to one token contract
pub struct EvmRpcClient {
    url: String,
    client: reqwest::Client,
    token_contract: String,
    token_decimals: u32,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    pub fn new(
        url: &str,
        token_contract: &str,
        token_decimals: u32,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(url, token = token_contract, "Initializing EVM JSON-RPC client");

        Ok(Self {
            url: url.to_string(),
            client,
            token_contract: normalize_address(token_contract)?,
            token_decimals,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call a method whose result may legitimately be `null`
    async fn call_optional<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let rpc_response: JsonRpcResponse<R> = response.json().await?;

        if let Some(error) = rpc_response.error {
            return Err(ChainError::from_rpc(error.code, &error.message));
        }

        Ok(rpc_response.result)
    }

    async fn call<T, R>(&self, method: &'static str, params: T) -> Result<R, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Parse(format!("No result in {} response", method)))
    }

    fn parse_log(&self, log: RpcLog) -> Result<Option<ChainTransferEvent>, ChainError> {
        if log.removed {
            debug!(tx_hash = %log.transaction_hash, "Skipping removed log");
            return Ok(None);
        }
        if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
            return Ok(None);
        }

        let raw = BigUint::parse_bytes(log.data.trim_start_matches("0x").as_bytes(), 16)
            .ok_or_else(|| ChainError::Parse(format!("invalid transfer data {}", log.data)))?;

        Ok(Some(ChainTransferEvent {
            tx_hash: log.transaction_hash.to_lowercase(),
            log_index: parse_hex_u64(&log.log_index)?,
            from_address: topic_to_address(&log.topics[1])?,
            to_address: topic_to_address(&log.topics[2])?,
            amount: MoneyAmount::from_units(BigInt::from(raw), self.token_decimals),
            block_number: parse_hex_u64(&log.block_number)?,
            block_hash: log.block_hash.to_lowercase(),
        }))
    }
}

#[async_trait]
impl ChainRpc for EvmRpcClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let result: String = self.call(methods::BLOCK_NUMBER, ()).await?;
        parse_hex_u64(&result)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHead>, ChainError> {
        let block: Option<RpcBlock> = self
            .call_optional(methods::GET_BLOCK, (format!("0x{:x}", number), false))
            .await?;

        block
            .map(|b| {
                Ok(BlockHead {
                    number: parse_hex_u64(&b.number)?,
                    hash: b.hash.to_lowercase(),
                    parent_hash: b.parent_hash.to_lowercase(),
                })
            })
            .transpose()
    }

    async fn transfer_logs(
        &self,
        to: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainTransferEvent>, ChainError> {
        let filter = json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "address": self.token_contract,
            "topics": [TRANSFER_TOPIC, serde_json::Value::Null, address_to_topic(to)?],
        }]);

        let logs: Vec<RpcLog> = self.call(methods::GET_LOGS, filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(event) = self.parse_log(log)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn token_balance(&self, owner: &str) -> Result<MoneyAmount, ChainError> {
        // balanceOf(address)
        let data = format!("0x70a08231{}", &address_to_topic(owner)?[2..]);
        let result: String = self
            .call(
                methods::TOKEN_BALANCE,
                json!([{ "to": self.token_contract, "data": data }, "latest"]),
            )
            .await?;
        let body = result.trim_start_matches("0x");
        let raw = if body.is_empty() {
            BigUint::default()
        } else {
            BigUint::parse_bytes(body.as_bytes(), 16)
                .ok_or_else(|| ChainError::Parse(format!("invalid balanceOf result {}", result)))?
        };
        Ok(MoneyAmount::from_units(BigInt::from(raw), self.token_decimals))
    }

    async fn native_balance(&self, owner: &str) -> Result<u128, ChainError> {
        let result: String = self
            .call(methods::NATIVE_BALANCE, (normalize_address(owner)?, "latest"))
            .await?;
        parse_hex_u128(&result)
    }

    async fn pending_nonce(&self, owner: &str) -> Result<u64, ChainError> {
        let result: String = self
            .call(methods::NONCE, (normalize_address(owner)?, "pending"))
            .await?;
        parse_hex_u64(&result)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let result: String = self.call(methods::GAS_PRICE, ()).await?;
        parse_hex_u128(&result)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self.call_optional(methods::RECEIPT, [tx_hash]).await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            tx_hash: receipt.transaction_hash.to_lowercase(),
            block_number: parse_hex_u64(&block_number)?,
            success: receipt.status.as_deref() == Some("0x1"),
        }))
    }

    async fn transaction_known(&self, tx_hash: &str) -> Result<bool, ChainError> {
        let tx: Option<serde_json::Value> = self.call_optional(methods::GET_TX, [tx_hash]).await?;
        Ok(tx.is_some_and(|v| !v.is_null()))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ChainError> {
        let encoded = format!("0x{}", hex::encode(raw));
        let hash: String = self.call(methods::SEND_RAW, [encoded]).await?;
        Ok(hash.to_lowercase())
    }
}
