//! Prometheus metrics for the sidecar.
//!
//! Recording functions are cheap no-ops until [`install_recorder`] has been
//! called, so library users and tests never need a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder.
///
/// Returns `None` if a recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_metric_descriptions();
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("Failed to install metrics recorder: {}", e);
            None
        }
    }
}

fn register_metric_descriptions() {
    describe_counter!(
        "handoff_forward_attempts_total",
        "Queue send attempts by result"
    );
    describe_counter!(
        "handoff_forwards_total",
        "Forwards completed by final result"
    );
    describe_histogram!(
        "handoff_forward_duration_seconds",
        "Time from submission to final forward result"
    );
    describe_gauge!(
        "handoff_in_flight_forwards",
        "Forwards currently being attempted"
    );
    describe_counter!(
        "handoff_ingress_requests_total",
        "Ingress requests by response status"
    );
}

/// Records a single send attempt (`ack`, `retriable`, `fatal`, `timeout`).
pub fn record_attempt(result: &'static str) {
    counter!("handoff_forward_attempts_total", "result" => result).increment(1);
}

/// Records a completed forward.
pub fn record_forward(result: &'static str, duration: Duration) {
    counter!("handoff_forwards_total", "result" => result).increment(1);
    histogram!("handoff_forward_duration_seconds").record(duration.as_secs_f64());
}

/// Sets the in-flight forwards gauge.
pub fn set_in_flight(count: usize) {
    gauge!("handoff_in_flight_forwards").set(count as f64);
}

/// Records an answered ingress request.
pub fn record_ingress(status: u16) {
    counter!("handoff_ingress_requests_total", "status" => status.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_attempt("ack");
        record_forward("ack", Duration::from_millis(5));
        set_in_flight(1);
        record_ingress(200);
    }

    #[test]
    fn test_recorded_values_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_attempt("retriable");
            record_attempt("ack");
            record_forward("ack", Duration::from_millis(20));
            record_ingress(502);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"handoff_forward_attempts_total{result="retriable"} 1"#));
        assert!(rendered.contains(r#"handoff_forwards_total{result="ack"} 1"#));
        assert!(rendered.contains(r#"handoff_ingress_requests_total{status="502"} 1"#));
    }
}
