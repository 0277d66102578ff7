//! Logging and metrics setup.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, is_sensitive, redact, LogFormat};
pub use metrics::{init_metrics, MetricsRegistry};

use crate::config::ObservabilityConfig;

/// Initialize logging first so the metrics setup is logged.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<MetricsRegistry> {
    init_logging(config)?;
    init_metrics(config.prometheus)
}
