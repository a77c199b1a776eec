//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub use rally_rpc::metrics::{RPC_CALL_DURATION_SECONDS, RPC_CALLS_TOTAL, RPC_ERRORS_TOTAL};

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused because `max_connections` was reached (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connections closed for missing a heartbeat (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "heartbeat_timeouts_total";
/// Broadcast frames queued to topic members (counter).
pub const BROADCAST_FRAMES_TOTAL: &str = "broadcast_frames_total";

#[cfg(test)]
mod tests {
    use super::*;
    use rally_rpc::MethodRegistry;
    use serde_json::{Value, json};

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            RPC_CALLS_TOTAL,
            RPC_ERRORS_TOTAL,
            RPC_CALL_DURATION_SECONDS,
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_CONNECTIONS_REJECTED_TOTAL,
            HEARTBEAT_TIMEOUTS_TOTAL,
            BROADCAST_FRAMES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }

    #[test]
    fn dispatch_records_under_exported_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let registry: MethodRegistry<()> = MethodRegistry::new();
        registry.register_fn("echo", |(), params| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        });

        metrics::with_local_recorder(&recorder, || {
            let _ = futures::executor::block_on(registry.dispatch((), 1, "echo", vec![json!(1)]));
            let _ = futures::executor::block_on(registry.dispatch((), 2, "missing", vec![]));
        });

        let output = render(&handle);
        assert!(output.contains(&format!("{RPC_CALLS_TOTAL}{{method=\"echo\"}} 1")));
        assert!(output.contains(&format!("{RPC_CALLS_TOTAL}{{method=\"missing\"}} 1")));
        assert!(output.contains(&format!("{RPC_ERRORS_TOTAL}{{method=\"missing\"}} 1")));
        assert!(output.contains(RPC_CALL_DURATION_SECONDS));
    }
}
