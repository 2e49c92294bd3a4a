//! Metrics definitions for the RPC harness.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rpc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `method`: bounded by the four Hello methods
//! - `shape`: 4 values (unary, client_streaming, server_streaming, bidi)
//! - `outcome`: bounded by gRPC status codes (17 values)
//! - `direction`: 2 values (sent, received)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return its handle.
///
/// Must be called before any metrics are recorded. Call latency buckets
/// cover the relay pre-forward delay (800ms) and the processing delay (2s).
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rpc_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set call duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record one finished call.
///
/// Metrics: `rpc_calls_total`, `rpc_call_duration_seconds`
/// Labels: `method`, `shape`, `outcome` (counter only)
pub fn record_call(method: &str, shape: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        "rpc_calls_total",
        "method" => method.to_string(),
        "shape" => shape,
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        "rpc_call_duration_seconds",
        "method" => method.to_string(),
        "shape" => shape
    )
    .record(duration.as_secs_f64());
}

/// Record one stream message.
///
/// Metric: `rpc_stream_messages_total`
/// Labels: `method`, `direction` (sent, received)
pub fn record_stream_message(method: &str, direction: &'static str) {
    counter!(
        "rpc_stream_messages_total",
        "method" => method.to_string(),
        "direction" => direction
    )
    .increment(1);
}

/// Set the number of routed sessions on a connection.
///
/// Metric: `rpc_sessions_active`
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rpc_sessions_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; they must not panic.
    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_call("/helloworld.Hello/UnaryHello", "unary", "ok", Duration::from_millis(3));
        record_stream_message("/helloworld.Hello/BidirectionalStreamingHello", "sent");
        set_sessions_active(2);
    }
}
