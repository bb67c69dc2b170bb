//! Request limiter for the node provider.
//!
//! Three gates, applied in order to every outbound RPC request:
//! 1. a concurrency ceiling (semaphore)
//! 2. a token bucket (`reservoir` tokens, `refill_amount` added every `refill_interval`)
//! 3. a minimum spacing between dispatches
//!
//! Excess requests wait in line; nothing is rejected unless the limiter is drained.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::ChainError;

/// Provider plan, selects default limiter parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcTier {
    #[default]
    Free,
    Growth,
    Enterprise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitParams {
    pub max_concurrent: usize,
    pub min_interval_ms: u64,
    /// Burst capacity
    pub reservoir: u32,
    pub refill_amount: u32,
    pub refill_interval_ms: u64,
}

impl RateLimitParams {
    pub fn for_tier(tier: RpcTier) -> Self {
        match tier {
            RpcTier::Free => Self {
                max_concurrent: 2,
                min_interval_ms: 100,
                reservoir: 10,
                refill_amount: 10,
                refill_interval_ms: 1_000,
            },
            RpcTier::Growth => Self {
                max_concurrent: 5,
                min_interval_ms: 25,
                reservoir: 50,
                refill_amount: 50,
                refill_interval_ms: 1_000,
            },
            RpcTier::Enterprise => Self {
                max_concurrent: 16,
                min_interval_ms: 0,
                reservoir: 200,
                refill_amount: 200,
                refill_interval_ms: 1_000,
            },
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms.max(1))
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_dispatch: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant, params: &RateLimitParams) {
        let interval = params.refill_interval();
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_nanos() / interval.as_nanos()) as u32;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(params.refill_amount);
        self.tokens = self.tokens.saturating_add(added).min(params.reservoir);
        self.last_refill += interval * periods;
    }

    /// Time until a dispatch may happen, or `None` if one may happen now.
    fn wait_time(&self, now: Instant, params: &RateLimitParams) -> Option<Duration> {
        let spacing = self
            .last_dispatch
            .map(|t| (t + params.min_interval()).saturating_duration_since(now))
            .unwrap_or_default();

        if self.tokens == 0 {
            let refill = (self.last_refill + params.refill_interval()).saturating_duration_since(now);
            return Some(refill.max(spacing).max(Duration::from_millis(1)));
        }
        if spacing.is_zero() { None } else { Some(spacing) }
    }
}

pub struct RateLimiter {
    params: RateLimitParams,
    semaphore: Semaphore,
    bucket: Mutex<Bucket>,
    queued: AtomicUsize,
    draining: AtomicBool,
}

impl RateLimiter {
    pub fn new(params: RateLimitParams) -> Self {
        let params = RateLimitParams {
            max_concurrent: params.max_concurrent.max(1),
            reservoir: params.reservoir.max(1),
            refill_amount: params.refill_amount.max(1),
            ..params
        };
        debug!(?params, "Rate limiter configured");
        Self {
            semaphore: Semaphore::new(params.max_concurrent),
            bucket: Mutex::new(Bucket {
                tokens: params.reservoir,
                last_refill: Instant::now(),
                last_dispatch: None,
            }),
            params,
            queued: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &RateLimitParams {
        &self.params
    }

    /// Wait for a dispatch slot. Hold the returned permit for the duration of the request.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, ChainError> {
        if self.is_draining() {
            return Err(ChainError::Drained);
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        let result = self.acquire_slot().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, ChainError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ChainError::Drained)?;

        loop {
            if self.is_draining() {
                return Err(ChainError::Drained);
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                bucket.refill(now, &self.params);
                match bucket.wait_time(now, &self.params) {
                    None => {
                        bucket.tokens -= 1;
                        bucket.last_dispatch = Some(now);
                        return Ok(permit);
                    }
                    Some(wait) => wait,
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Requests waiting for a slot
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.params
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Fail every queued and future request with [`ChainError::Drained`].
    pub fn drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            warn!(queued = self.queue_depth(), "Draining chain request queue");
            self.semaphore.close();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
