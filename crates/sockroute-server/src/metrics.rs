//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants shared by the actor, keepalive and server.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections fully closed total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connection actors (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Frames run through the dispatch bridge (counter, labels: route).
pub const WS_FRAMES_DISPATCHED_TOTAL: &str = "ws_frames_dispatched_total";
/// Recovered handler failures (counter, labels: kind).
pub const WS_HANDLER_FAILURES_TOTAL: &str = "ws_handler_failures_total";
/// Failed keepalive probes (counter).
pub const WS_KEEPALIVE_FAILURES_TOTAL: &str = "ws_keepalive_failures_total";
/// Time from dispatch to reply (histogram, labels: route).
pub const WS_DISPATCH_DURATION_SECONDS: &str = "ws_dispatch_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_FRAMES_DISPATCHED_TOTAL,
            WS_HANDLER_FAILURES_TOTAL,
            WS_KEEPALIVE_FAILURES_TOTAL,
            WS_DISPATCH_DURATION_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
