//! Prometheus export of the runtime's counters, gauges and histograms.
//!
//! Call sites use the `metrics` macros directly; this module only installs
//! the recorder and describes the series.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Handle for rendering the text exposition format.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus", &self.handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }
}

/// Install the process-wide Prometheus recorder.
///
/// A second call reuses the recorder installed by the first.
pub fn init_metrics(enabled: bool) -> anyhow::Result<MetricsRegistry> {
    if !enabled {
        return Ok(MetricsRegistry::disabled());
    }
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(MetricsRegistry {
            handle: Some(handle.clone()),
        });
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)?
        .install_recorder()?;
    register_metric_descriptions();

    let handle = PROMETHEUS.get_or_init(|| handle).clone();
    tracing::info!("Prometheus recorder installed");
    Ok(MetricsRegistry { handle: Some(handle) })
}

fn register_metric_descriptions() {
    describe_counter!(
        "gsm_messages_processed_total",
        "Module invocations by kind and outcome"
    );
    describe_histogram!(
        "gsm_http_request_duration_seconds",
        "Web module invocation time in seconds"
    );
    describe_histogram!(
        "gsm_event_duration_seconds",
        "Event module invocation time in seconds"
    );
    describe_counter!(
        "gsm_module_timeouts_total",
        "Module invocations cut off by the invocation timeout"
    );
    describe_gauge!("gsm_live_modules", "Modules live at the home location");
    describe_counter!(
        "gsm_queue_poll_errors_total",
        "Queue poll failures by scope and kind"
    );
    describe_counter!(
        "gsm_batch_dispatches_total",
        "Batch module runs dispatched by the scheduler"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = init_metrics(false).unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }
}
