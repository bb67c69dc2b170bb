//! Payout transaction signing.
//!
//! [`LocalKeySigner`] signs legacy (EIP-155) transactions calling the token's
//! `transfer(address,uint256)`. The key is loaded from a [`SecretRef`], never
//! from inline configuration.

use k256::ecdsa::SigningKey;
use num_bigint::BigUint;
use rlp::RlpStream;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

use super::error::ChainError;
use super::types::normalize_address;

/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Where a secret lives: `env:VAR_NAME` or `file:/path/to/key`
#[derive(Clone, PartialEq, Eq)]
pub enum SecretRef {
    Env(String),
    File(PathBuf),
}

impl SecretRef {
    pub fn parse(value: &str) -> Result<Self, ChainError> {
        if let Some(var) = value.strip_prefix("env:") {
            if var.is_empty() {
                return Err(ChainError::Config("empty env secret reference".into()));
            }
            return Ok(SecretRef::Env(var.to_string()));
        }
        if let Some(path) = value.strip_prefix("file:") {
            if path.is_empty() {
                return Err(ChainError::Config("empty file secret reference".into()));
            }
            return Ok(SecretRef::File(PathBuf::from(path)));
        }
        Err(ChainError::Config(
            "secret reference must start with env: or file:".into(),
        ))
    }

    pub fn resolve(&self) -> Result<String, ChainError> {
        match self {
            SecretRef::Env(var) => std::env::var(var)
                .map_err(|_| ChainError::Config(format!("secret env var {} not set", var))),
            SecretRef::File(path) => std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| {
                    ChainError::Config(format!("cannot read secret {}: {}", path.display(), e))
                }),
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Env(var) => write!(f, "env:{}", var),
            SecretRef::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub chain_id: u64,
    pub token_contract: String,
    pub recipient: String,
    /// Amount in token base units
    pub amount_units: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    pub tx_hash: String,
}

pub trait PayoutSigner: Send + Sync {
    /// Lowercase `0x` address the signer pays from
    fn address(&self) -> &str;

    fn sign_token_transfer(&self, tx: &TokenTransferTx) -> Result<SignedTransaction, ChainError>;
}

pub struct LocalKeySigner {
    key: SigningKey,
    address: String,
}

impl LocalKeySigner {
    pub fn from_hex(key_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(key_hex.trim().trim_start_matches("0x"))
            .map_err(|_| ChainError::Signer("private key is not valid hex".into()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|_| ChainError::Signer("invalid secp256k1 private key".into()))?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    pub fn from_secret(secret: &SecretRef) -> Result<Self, ChainError> {
        let signer = Self::from_hex(&secret.resolve()?)?;
        info!(address = %signer.address, source = ?secret, "Payout signer loaded");
        Ok(signer)
    }
}

impl PayoutSigner for LocalKeySigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign_token_transfer(&self, tx: &TokenTransferTx) -> Result<SignedTransaction, ChainError> {
        let fields = TxFields::new(tx)?;
        let digest = Keccak256::digest(fields.signing_payload(tx.chain_id));

        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ChainError::Signer(e.to_string()))?;

        let v = u64::from(recovery_id.to_byte()) + tx.chain_id * 2 + 35;
        let sig_bytes = signature.to_bytes();
        let raw = fields.signed_payload(v, &sig_bytes[..32], &sig_bytes[32..]);
        let tx_hash = format!("0x{}", hex::encode(Keccak256::digest(&raw)));

        Ok(SignedTransaction { raw, tx_hash })
    }
}

fn address_of(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Big-endian bytes without leading zeros (RLP integer form)
fn trimmed(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn decode_address(address: &str) -> Result<Vec<u8>, ChainError> {
    let normalized = normalize_address(address)?;
    hex::decode(&normalized[2..]).map_err(|e| ChainError::Parse(e.to_string()))
}

struct TxFields {
    nonce: u64,
    gas_price: Vec<u8>,
    gas_limit: u64,
    to: Vec<u8>,
    data: Vec<u8>,
}

impl TxFields {
    fn new(tx: &TokenTransferTx) -> Result<Self, ChainError> {
        let amount = tx.amount_units.to_bytes_be();
        if amount.len() > 32 {
            return Err(ChainError::Signer("amount exceeds uint256".into()));
        }

        let mut data = Vec::with_capacity(68);
        data.extend_from_slice(&TRANSFER_SELECTOR);
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&decode_address(&tx.recipient)?);
        data.extend(std::iter::repeat_n(0u8, 32 - amount.len()));
        data.extend_from_slice(&amount);

        Ok(Self {
            nonce: tx.nonce,
            gas_price: trimmed(&tx.gas_price.to_be_bytes()),
            gas_limit: tx.gas_limit,
            to: decode_address(&tx.token_contract)?,
            data,
        })
    }

    fn append_common(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to);
        // native value is always zero for token transfers
        stream.append(&Vec::<u8>::new());
        stream.append(&self.data);
    }

    fn signing_payload(&self, chain_id: u64) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&chain_id);
        stream.append(&0u64);
        stream.append(&0u64);
        stream.out().to_vec()
    }

    fn signed_payload(&self, v: u64, r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&v);
        stream.append(&trimmed(r));
        stream.append(&trimmed(s));
        stream.out().to_vec()
    }
}
