use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;

use super::error::ChainError;
use super::rpc::methods;

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";

/// Point-in-time view of chain access health.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainMetricsSnapshot {
    /// Total requests per RPC method
    pub request_counts: BTreeMap<String, u64>,
    /// Successful share of all completed requests, 1.0 when nothing ran yet
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub queue_depth: u64,
}

#[derive(Clone, Debug)]
pub struct ChainMetrics {
    registry: Registry,
    pub(crate) rpc_requests: IntCounterVec,
    pub(crate) rpc_latency: HistogramVec,
    pub(crate) rpc_retries: IntCounterVec,
    pub(crate) queue_depth: IntGauge,
    pub(crate) in_flight: IntGauge,
    pub(crate) rate_limit_bypass: IntCounter,
}

impl ChainMetrics {
    pub fn new() -> Result<Self, ChainError> {
        let registry = Registry::new();

        let rpc_requests = IntCounterVec::new(
            Opts::new("chain_rpc_requests_total", "RPC requests by method and outcome"),
            &["method", "outcome"],
        )
        .map_err(metrics_err)?;
        let rpc_latency = HistogramVec::new(
            HistogramOpts::new("chain_rpc_latency_seconds", "RPC request latency by method")
                .buckets(LATENCY_SEC_BUCKETS.to_vec()),
            &["method"],
        )
        .map_err(metrics_err)?;
        let rpc_retries = IntCounterVec::new(
            Opts::new("chain_rpc_retries_total", "Transient-failure retries by method"),
            &["method"],
        )
        .map_err(metrics_err)?;
        let queue_depth = IntGauge::new(
            "chain_rpc_queue_depth",
            "Requests waiting for a rate-limiter slot",
        )
        .map_err(metrics_err)?;
        let in_flight = IntGauge::new("chain_rpc_in_flight", "Requests currently dispatched")
            .map_err(metrics_err)?;
        let rate_limit_bypass = IntCounter::new(
            "chain_rpc_rate_limit_bypass_total",
            "Raw provider accesses that skipped the limiter",
        )
        .map_err(metrics_err)?;

        registry
            .register(Box::new(rpc_requests.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(rpc_latency.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(rpc_retries.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(rate_limit_bypass.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            rpc_requests,
            rpc_latency,
            rpc_retries,
            queue_depth,
            in_flight,
            rate_limit_bypass,
        })
    }

    pub fn record(&self, method: &str, ok: bool, latency_secs: f64) {
        let outcome = if ok { OUTCOME_OK } else { OUTCOME_ERROR };
        self.rpc_requests
            .with_label_values(&[method, outcome])
            .inc();
        self.rpc_latency
            .with_label_values(&[method])
            .observe(latency_secs);
    }

    pub fn snapshot(&self) -> ChainMetricsSnapshot {
        let mut request_counts = BTreeMap::new();
        let mut ok_total = 0u64;
        let mut all_total = 0u64;
        let mut latency_sum = 0.0;
        let mut latency_count = 0u64;

        for method in methods::ALL {
            let ok = self
                .rpc_requests
                .with_label_values(&[method, OUTCOME_OK])
                .get();
            let err = self
                .rpc_requests
                .with_label_values(&[method, OUTCOME_ERROR])
                .get();
            if ok + err > 0 {
                request_counts.insert(method.to_string(), ok + err);
            }
            ok_total += ok;
            all_total += ok + err;

            let histogram = self.rpc_latency.with_label_values(&[method]);
            latency_sum += histogram.get_sample_sum();
            latency_count += histogram.get_sample_count();
        }

        ChainMetricsSnapshot {
            request_counts,
            success_rate: if all_total == 0 {
                1.0
            } else {
                ok_total as f64 / all_total as f64
            },
            average_latency_ms: if latency_count == 0 {
                0.0
            } else {
                latency_sum * 1000.0 / latency_count as f64
            },
            queue_depth: self.queue_depth.get().max(0) as u64,
        }
    }

    /// Prometheus text exposition of this registry
    pub fn encode_text(&self) -> Result<String, ChainError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| ChainError::Parse(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> ChainError {
    ChainError::Config(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_and_success_rate() {
        let metrics = ChainMetrics::new().unwrap();
        assert_eq!(metrics.snapshot().success_rate, 1.0);

        metrics.record(methods::BLOCK_NUMBER, true, 0.010);
        metrics.record(methods::BLOCK_NUMBER, true, 0.030);
        metrics.record(methods::GET_LOGS, false, 0.020);
        metrics.record(methods::GET_LOGS, true, 0.020);
        metrics.queue_depth.set(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_counts[methods::BLOCK_NUMBER], 2);
        assert_eq!(snapshot.request_counts[methods::GET_LOGS], 2);
        assert!((snapshot.success_rate - 0.75).abs() < 1e-9);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 1e-6);
        assert_eq!(snapshot.queue_depth, 3);
    }

    #[test]
    fn test_text_exposition() {
        let metrics = ChainMetrics::new().unwrap();
        metrics.record(methods::GAS_PRICE, true, 0.001);
        metrics.rate_limit_bypass.inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("chain_rpc_requests_total{method=\"eth_gasPrice\",outcome=\"ok\"} 1"));
        assert!(text.contains("chain_rpc_rate_limit_bypass_total 1"));
    }
}
