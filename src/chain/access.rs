//! Chain Access Layer
//!
//! Every request/response call to the node goes through [`ChainAccess`]:
//! the rate limiter first, then bounded exponential-backoff retry for transient
//! failures, with counts and latency recorded per method. Subscriptions are not
//! routed through here (see [`super::feed`]).

use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::error::ChainError;
use super::limiter::{RateLimitParams, RateLimiter};
use super::metrics::{ChainMetrics, ChainMetricsSnapshot};
use super::rpc::{ChainRpc, methods};
use super::types::{BlockHead, ChainTransferEvent, NodeHealth, TxReceipt};
use crate::money::MoneyAmount;

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetrySettings {
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ChainAccessConfig {
    pub limits: RateLimitParams,
    pub retry: RetrySettings,
    /// Block span of one `eth_getLogs` request
    pub log_chunk_size: u64,
}

pub struct ChainAccess {
    rpc: Arc<dyn ChainRpc>,
    limiter: RateLimiter,
    metrics: ChainMetrics,
    retry: RetrySettings,
    log_chunk_size: u64,
}

impl ChainAccess {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: ChainAccessConfig) -> Result<Self, ChainError> {
        Ok(Self {
            rpc,
            limiter: RateLimiter::new(config.limits),
            metrics: ChainMetrics::new()?,
            retry: config.retry,
            log_chunk_size: config.log_chunk_size.max(1),
        })
    }

    /// Unthrottled provider handle for privileged callers.
    ///
    /// Every use is logged and counted as a rate-limit bypass.
    pub fn raw(&self, caller: &str) -> Arc<dyn ChainRpc> {
        self.metrics.rate_limit_bypass.inc();
        warn!(target: "rate_limit_bypass", caller, "Raw provider access bypasses the rate limiter");
        self.rpc.clone()
    }

    async fn request<T, F, Fut>(&self, method: &'static str, retries: u32, op: F) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 0u32;
        loop {
            self.metrics.queue_depth.inc();
            let permit = self.limiter.acquire().await;
            self.metrics.queue_depth.dec();
            let permit = permit?;

            self.metrics.in_flight.inc();
            let started = Instant::now();
            let result = op().await;
            self.metrics
                .record(method, result.is_ok(), started.elapsed().as_secs_f64());
            self.metrics.in_flight.dec();
            drop(permit);

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    self.metrics.rpc_retries.with_label_values(&[method]).inc();
                    warn!(
                        method,
                        attempt,
                        max = retries,
                        ?delay,
                        error = %e,
                        "Transient RPC failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!(method, attempts = attempt + 1, error = %e, "RPC retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        self.request(methods::BLOCK_NUMBER, self.retry.max_retries, || {
            self.rpc.block_number()
        })
        .await
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Option<BlockHead>, ChainError> {
        self.request(methods::GET_BLOCK, self.retry.max_retries, || {
            self.rpc.block_by_number(number)
        })
        .await
    }

    /// Canonical hash at `number`, `None` if the node has no such block yet
    pub async fn block_hash(&self, number: u64) -> Result<Option<String>, ChainError> {
        Ok(self.block_by_number(number).await?.map(|b| b.hash))
    }

    /// Transfer logs over `[from_block, to_block]`, split into fixed-size
    /// chunks that all pass through the limiter. Ordered by block then log index.
    pub async fn transfer_logs(
        &self,
        to: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainTransferEvent>, ChainError> {
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let mut ranges = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = start.saturating_add(self.log_chunk_size - 1).min(to_block);
            ranges.push((start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        debug!(from_block, to_block, chunks = ranges.len(), "Querying transfer logs");

        let chunks = try_join_all(ranges.into_iter().map(|(start, end)| {
            self.request(methods::GET_LOGS, self.retry.max_retries, move || {
                self.rpc.transfer_logs(to, start, end)
            })
        }))
        .await?;

        let mut events: Vec<ChainTransferEvent> = chunks.into_iter().flatten().collect();
        events.sort_by(|a, b| {
            (a.block_number, a.log_index).cmp(&(b.block_number, b.log_index))
        });
        Ok(events)
    }

    pub async fn token_balance(&self, owner: &str) -> Result<MoneyAmount, ChainError> {
        self.request(methods::TOKEN_BALANCE, self.retry.max_retries, || {
            self.rpc.token_balance(owner)
        })
        .await
    }

    pub async fn native_balance(&self, owner: &str) -> Result<u128, ChainError> {
        self.request(methods::NATIVE_BALANCE, self.retry.max_retries, || {
            self.rpc.native_balance(owner)
        })
        .await
    }

    pub async fn pending_nonce(&self, owner: &str) -> Result<u64, ChainError> {
        self.request(methods::NONCE, self.retry.max_retries, || {
            self.rpc.pending_nonce(owner)
        })
        .await
    }

    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.request(methods::GAS_PRICE, self.retry.max_retries, || {
            self.rpc.gas_price()
        })
        .await
    }

    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        self.request(methods::RECEIPT, self.retry.max_retries, || {
            self.rpc.transaction_receipt(tx_hash)
        })
        .await
    }

    pub async fn transaction_known(&self, tx_hash: &str) -> Result<bool, ChainError> {
        self.request(methods::GET_TX, self.retry.max_retries, || {
            self.rpc.transaction_known(tx_hash)
        })
        .await
    }

    /// Broadcast once. A lost response is resolved by the caller looking the
    /// hash up later, not by resending here.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ChainError> {
        self.request(methods::SEND_RAW, 0, || self.rpc.send_raw_transaction(raw))
            .await
    }

    pub async fn health(&self) -> Result<NodeHealth, ChainError> {
        let height = self.block_number().await?;
        let head = self
            .block_by_number(height)
            .await?
            .ok_or(ChainError::BlockNotFound(height))?;
        Ok(NodeHealth {
            block_height: height,
            block_hash: head.hash,
        })
    }

    pub fn metrics_snapshot(&self) -> ChainMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_text(&self) -> Result<String, ChainError> {
        self.metrics.encode_text()
    }

    pub fn queue_depth(&self) -> usize {
        self.limiter.queue_depth()
    }

    /// Emergency shutdown: queued and future requests fail with [`ChainError::Drained`].
    pub fn drain(&self) {
        self.limiter.drain();
    }
}
