//! Health status types.
//!
//! - **Healthy**: fully operational
//! - **Degraded**: serving, with a condition worth attention
//! - **Unhealthy**: not serving

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const SERVICE_NAME: &str = "gsm-server";

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// The worse of the two.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    pub fn to_http_status(&self) -> u16 {
        if self.is_operational() {
            200
        } else {
            503
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Only present when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn with_initial(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Unhealthy)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Record an error; marks the component unhealthy.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Report
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,

    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_secs: None,
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            match component.status {
                HealthStatus::Healthy => self.summary.healthy += 1,
                HealthStatus::Degraded => self.summary.degraded += 1,
                HealthStatus::Unhealthy => self.summary.unhealthy += 1,
            }
            self.components.push(component);
        }
        self.summary.total = self.components.len();
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Liveness probe body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl LivenessResponse {
    pub fn alive() -> Self {
        Self {
            alive: true,
            service: SERVICE_NAME.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combine() {
        assert_eq!(HealthStatus::Healthy.combine(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.combine(HealthStatus::Unhealthy), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unhealthy.to_http_status(), 503);
        assert_eq!(HealthStatus::Degraded.to_http_status(), 200);
    }

    #[test]
    fn test_report_summary() {
        let report = HealthReport::new().with_components(vec![
            ComponentHealth::healthy("backend"),
            ComponentHealth::degraded("memory"),
            ComponentHealth::healthy("listener:global").with_error("dead"),
        ]);

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.unhealthy, 1);
        assert!(report.component("memory").is_some());
    }
}
