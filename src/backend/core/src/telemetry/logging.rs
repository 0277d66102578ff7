//! Structured logging.
//!
//! JSON output for deployments, pretty or compact output for local runs.
//! `RUST_LOG` overrides the configured level when set.

use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Header and field names whose values never reach the log.
const SENSITIVE_FIELDS: &[&str] = &["authorization", "password", "secret", "token", "cookie"];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Whether a field or header name carries a credential.
pub fn is_sensitive(field_name: &str) -> bool {
    let lower = field_name.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|f| lower.contains(f))
}

pub fn redact<'a>(field_name: &str, value: &'a str) -> &'a str {
    if is_sensitive(field_name) {
        REDACTED
    } else {
        value
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is
/// the normal case inside test binaries.
pub fn init_logging(config: &ObservabilityConfig) -> anyhow::Result<bool> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    let format = config.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{}; falling back to json", e);
        LogFormat::Json
    });

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_file(true).with_line_number(true))
            .try_init()
            .is_ok(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .is_ok(),
    };

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_redaction() {
        assert_eq!(redact("Authorization", "Basic Zm9vOmJhcg=="), REDACTED);
        assert_eq!(redact("admin_password", "hunter2"), REDACTED);
        assert_eq!(redact("host", "example.com"), "example.com");
    }

    #[test]
    fn test_second_init_is_not_an_error() {
        let config = ObservabilityConfig::default();
        let _ = init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
