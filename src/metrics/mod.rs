//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and watcher progress
//! - HTLC transactions submitted by the relayer
//! - Swap lifecycle transitions
//! - Refund sweeps

use crate::error::{RelayerError, RelayerResult};
use crate::swap::{Chain, SwapDirection, SwapStatus};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref WATCHER_CHECKPOINT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_watcher_checkpoint",
        "Last persisted watcher position (block on EVM, event sequence on Aptos)",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_received_total",
        "Total HTLC events received by type",
        &["chain", "event_type"]
    ).unwrap();

    // Transaction metrics
    pub static ref CHAIN_TX: CounterVec = register_counter_vec!(
        "htlc_relayer_transactions_total",
        "HTLC transactions submitted by the relayer",
        &["chain", "action", "result"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_INITIATED: CounterVec = register_counter_vec!(
        "htlc_relayer_swaps_initiated_total",
        "Total swaps initiated by direction",
        &["direction"]
    ).unwrap();

    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "htlc_relayer_swap_transitions_total",
        "Total swap status transitions by target status",
        &["status"]
    ).unwrap();

    pub static ref SWEEP_RUNS: CounterVec = register_counter_vec!(
        "htlc_relayer_sweep_runs_total",
        "Total refund sweeps run",
        &[]
    ).unwrap();

    pub static ref SWEEP_RESULTS: CounterVec = register_counter_vec!(
        "htlc_relayer_sweep_swaps_total",
        "Swaps settled by the refund sweep",
        &["outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "htlc_relayer_health_checks_total",
        "Total health checks by result",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    host: String,
    port: u16,
}

impl MetricsServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid metrics address: {}", e)))?;
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_chain_health(chain: Chain, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_checkpoint(chain: Chain, position: u64) {
    WATCHER_CHECKPOINT
        .with_label_values(&[chain.as_str()])
        .set(position as f64);
}

pub fn record_event(chain: Chain, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), event_type])
        .inc();
}

pub fn record_chain_tx(chain: Chain, action: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    CHAIN_TX
        .with_label_values(&[chain.as_str(), action, result])
        .inc();
}

pub fn record_swap_initiated(direction: SwapDirection) {
    SWAPS_INITIATED
        .with_label_values(&[direction.as_str()])
        .inc();
}

pub fn record_transition(status: SwapStatus) {
    SWAP_TRANSITIONS
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_sweep(refunded: usize, failed: usize) {
    SWEEP_RUNS.with_label_values(&[]).inc();
    SWEEP_RESULTS
        .with_label_values(&["refunded"])
        .inc_by(refunded as f64);
    SWEEP_RESULTS
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        record_transition(SwapStatus::Completed);
        record_chain_tx(Chain::Aptos, "withdraw", false);
        record_chain_health(Chain::Evm, true);

        let text = render().unwrap();
        assert!(text.contains("htlc_relayer_swap_transitions_total{status=\"COMPLETED\"}"));
        assert!(text.contains("action=\"withdraw\""));
        assert!(text.contains("htlc_relayer_chain_connected{chain=\"evm\"}"));
    }
}
