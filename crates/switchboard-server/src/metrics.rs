//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across crates.

/// Envelopes routed to a handler (counter, labels: topic).
pub const FRAMES_TOTAL: &str = "switchboard_frames_total";
/// Errors reported to the error handler (counter, labels: kind).
pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
/// Handler run time (histogram, labels: topic).
pub const HANDLER_DURATION_SECONDS: &str = "switchboard_handler_duration_seconds";
/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
/// Connections being served (gauge).
pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(!output.contains("panic"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            FRAMES_TOTAL,
            ERRORS_TOTAL,
            HANDLER_DURATION_SECONDS,
            CONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
        ];
        for name in names {
            assert!(name.starts_with("switchboard_"));
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
