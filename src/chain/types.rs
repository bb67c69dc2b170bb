//! Chain data types shared by the access layer, monitor and reconciler.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::ChainError;
use crate::money::MoneyAmount;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Observed token transfer. Uniquely identified by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransferEvent {
    pub tx_hash: String,
    pub log_index: u64,
    pub from_address: String,
    pub to_address: String,
    pub amount: MoneyAmount,
    pub block_number: u64,
    /// Hash of the including block, used to detect reorgs before forwarding
    pub block_hash: String,
}

impl ChainTransferEvent {
    pub fn key(&self) -> TransferKey {
        TransferKey {
            tx_hash: self.tx_hash.to_lowercase(),
            log_index: self.log_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub tx_hash: String,
    pub log_index: u64,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// New-head notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub block_height: u64,
    pub block_hash: String,
}

// ============================================================================
// Address / hex helpers
// ============================================================================

/// Lowercase `0x`-prefixed 20-byte address or an error.
pub fn normalize_address(address: &str) -> Result<String, ChainError> {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ChainError::Parse(format!("address missing 0x prefix: {}", address)))?;
    if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChainError::Parse(format!("malformed address: {}", address)));
    }
    Ok(format!("0x{}", body.to_lowercase()))
}

pub fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

pub fn is_zero_address(address: &str) -> bool {
    address
        .trim_start_matches("0x")
        .bytes()
        .all(|b| b == b'0')
}

pub fn parse_hex_u64(value: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Parse(format!("invalid hex quantity {}: {}", value, e)))
}

pub fn parse_hex_u128(value: &str) -> Result<u128, ChainError> {
    let body = value.trim_start_matches("0x");
    if body.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(body, 16)
        .map_err(|e| ChainError::Parse(format!("invalid hex quantity {}: {}", value, e)))
}

/// Last 20 bytes of a 32-byte topic as an address
pub fn topic_to_address(topic: &str) -> Result<String, ChainError> {
    let body = topic.trim_start_matches("0x");
    if body.len() != 64 {
        return Err(ChainError::Parse(format!("malformed topic: {}", topic)));
    }
    normalize_address(&format!("0x{}", &body[24..]))
}

/// Left-pad an address to a 32-byte topic
pub fn address_to_topic(address: &str) -> Result<String, ChainError> {
    let normalized = normalize_address(address)?;
    Ok(format!("0x{:0>64}", &normalized[2..]))
}
