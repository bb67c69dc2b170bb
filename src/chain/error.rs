use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ChainError {
    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC request timed out: {0}")]
    Timeout(String),

    #[error("Provider rate limit hit: {0}")]
    RateLimited(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Node rejected transaction: {0}")]
    Rejected(String),

    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Subscription transport error: {0}")]
    Subscription(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain access drained (shutting down)")]
    Drained,
}

impl ChainError {
    /// Transient failures are retried with backoff inside the access layer.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::RpcConnection(_)
            | ChainError::Timeout(_)
            | ChainError::RateLimited(_)
            | ChainError::Subscription(_) => true,
            // -32005: provider throttling, -32603: internal node error
            ChainError::Rpc { code, .. } => matches!(code, -32005 | -32603),
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChainError::RpcConnection(_) => "RPC_CONNECTION",
            ChainError::Timeout(_) => "RPC_TIMEOUT",
            ChainError::RateLimited(_) => "RATE_LIMITED",
            ChainError::Rpc { .. } => "RPC_ERROR",
            ChainError::Rejected(_) => "TX_REJECTED",
            ChainError::BlockNotFound(_) => "BLOCK_NOT_FOUND",
            ChainError::Parse(_) => "PARSE_ERROR",
            ChainError::Subscription(_) => "SUBSCRIPTION",
            ChainError::Signer(_) => "SIGNER",
            ChainError::Config(_) => "CONFIG",
            ChainError::Drained => "DRAINED",
        }
    }

    /// Map a JSON-RPC error object to the taxonomy.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();
        if code == -32005
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            return ChainError::RateLimited(message.to_string());
        }
        if lower.contains("nonce too low")
            || lower.contains("replacement transaction underpriced")
            || lower.contains("already known")
            || lower.contains("insufficient funds")
            || lower.contains("intrinsic gas too low")
            || lower.contains("exceeds block gas limit")
        {
            return ChainError::Rejected(message.to_string());
        }
        ChainError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout(e.to_string())
        } else if e.status().map(|s| s.as_u16()) == Some(429) {
            ChainError::RateLimited(e.to_string())
        } else if e.is_decode() {
            ChainError::Parse(e.to_string())
        } else {
            ChainError::RpcConnection(e.to_string())
        }
    }
}
