//! Prometheus metrics recording and endpoint.
//!
//! Recording functions compile to no-ops without the `metrics` feature.

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "metrics")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record a session admitted to the relay.
pub fn record_session_start() {
    #[cfg(feature = "metrics")]
    metrics::gauge!("relay_sessions_active").increment(1.0);
}

/// Record a session ending, labelled by outcome.
pub fn record_session_end(outcome: &str, duration_secs: f64) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("outcome", outcome.to_string())];
        metrics::gauge!("relay_sessions_active").decrement(1.0);
        metrics::counter!("relay_sessions_total", &labels).increment(1);
        metrics::histogram!("relay_session_duration_seconds", &labels).record(duration_secs);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (outcome, duration_secs);
}

/// Record a connection turned away at capacity.
pub fn record_rejected() {
    #[cfg(feature = "metrics")]
    metrics::counter!("relay_sessions_rejected_total").increment(1);
}

/// Record audio bytes moved in one direction ("inbound", "pcm", "outbound").
pub fn record_bytes(direction: &str, bytes: usize) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("direction", direction.to_string())];
        metrics::counter!("relay_audio_bytes_total", &labels).increment(bytes as u64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, bytes);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("kind", kind.to_string())];
        metrics::counter!("relay_errors_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "metrics")]
    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install is an error, not a panic.
        if let Ok(handle) = install_prometheus_recorder() {
            record_session_start();
            record_session_end("completed", 0.5);
            let output = handle.render();
            assert!(output.contains("relay_sessions_total"));
        }
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_session_start();
        record_bytes("inbound", 4096);
        record_rejected();
        record_error("transcoder_failure");
        record_session_end("failed", 1.25);
    }
}
