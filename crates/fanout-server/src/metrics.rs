//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Handshakes rejected total (counter, labels: code).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Connections reaped by the heartbeat (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// Frames delivered to local connections (counter, labels: kind).
pub const DELIVERIES_TOTAL: &str = "deliveries_total";
/// Frames that could not be queued on a local connection (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "delivery_failures_total";
/// Relays published to sibling hosts (counter, labels: kind).
pub const RELAYS_PUBLISHED_TOTAL: &str = "relays_published_total";
/// Relay publishes that failed (counter).
pub const RELAY_PUBLISH_FAILURES_TOTAL: &str = "relay_publish_failures_total";
/// Relays received from sibling hosts (counter, labels: outcome).
pub const RELAYS_RECEIVED_TOTAL: &str = "relays_received_total";
/// Presence directory failures (counter, labels: operation).
pub const DIRECTORY_ERRORS_TOTAL: &str = "directory_errors_total";
/// Route duration seconds (histogram, labels: kind).
pub const ROUTE_DURATION_SECONDS: &str = "route_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_HANDSHAKE_REJECTIONS_TOTAL,
            WS_HEARTBEAT_TIMEOUTS_TOTAL,
            DELIVERIES_TOTAL,
            DELIVERY_FAILURES_TOTAL,
            RELAYS_PUBLISHED_TOTAL,
            RELAY_PUBLISH_FAILURES_TOTAL,
            RELAYS_RECEIVED_TOTAL,
            DIRECTORY_ERRORS_TOTAL,
            ROUTE_DURATION_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
