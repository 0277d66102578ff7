//! Health checkers for the runtime's moving parts.
//!
//! - **Backend**: round trip to the cloud backend
//! - **Listeners**: each queue listener polled recently
//! - **Workers**: dispatch pool saturation
//! - **Plugins**: memory headroom and the timeout counter

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::check::ComponentHealth;
use crate::cloud::CloudBackend;
use crate::manager::PluginManager;
use crate::queue::{QueueListener, WorkerPool};

/// Latency above which a backend round trip counts as degraded.
const BACKEND_DEGRADED_AFTER: Duration = Duration::from_millis(500);

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BackendHealthChecker {
    backend: Arc<dyn CloudBackend>,
}

impl BackendHealthChecker {
    pub fn new(backend: Arc<dyn CloudBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthChecker for BackendHealthChecker {
    fn name(&self) -> &str {
        "backend"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.backend.ping().await;
        let latency = start.elapsed();

        match result {
            Ok(()) => {
                let health = if latency > BACKEND_DEGRADED_AFTER {
                    ComponentHealth::degraded(self.name()).with_message("Backend responding slowly")
                } else {
                    ComponentHealth::healthy(self.name())
                };
                health
                    .with_latency(latency)
                    .with_metadata("kind", self.backend.name())
            }
            Err(e) => {
                warn!(error = %e, "Backend health check failed");
                ComponentHealth::unhealthy(self.name())
                    .with_latency(latency)
                    .with_error(e.to_string())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Listeners
// ═══════════════════════════════════════════════════════════════════════════════

/// Unhealthy as soon as one listener has stopped polling.
pub struct ListenerHealthChecker {
    listeners: Vec<Arc<QueueListener>>,
}

impl ListenerHealthChecker {
    pub fn new(listeners: Vec<Arc<QueueListener>>) -> Self {
        Self { listeners }
    }
}

#[async_trait]
impl HealthChecker for ListenerHealthChecker {
    fn name(&self) -> &str {
        "listeners"
    }

    async fn check(&self) -> ComponentHealth {
        let now = Utc::now();
        let statuses: Vec<_> = self.listeners.iter().map(|l| l.status()).collect();
        let dead: Vec<&str> = self
            .listeners
            .iter()
            .filter(|l| l.is_dead_at(now))
            .map(|l| l.scope().as_str())
            .collect();

        let health = if dead.is_empty() {
            ComponentHealth::healthy(self.name())
        } else {
            ComponentHealth::unhealthy(self.name())
                .with_error(format!("listeners not polling: {}", dead.join(", ")))
        };
        health.with_metadata("listeners", statuses)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

pub struct WorkerPoolHealthChecker {
    pool: Arc<WorkerPool>,
}

impl WorkerPoolHealthChecker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthChecker for WorkerPoolHealthChecker {
    fn name(&self) -> &str {
        "workers"
    }

    async fn check(&self) -> ComponentHealth {
        let stats = self.pool.stats();
        let health = if !self.pool.is_healthy() {
            ComponentHealth::degraded(self.name()).with_message("Dispatch pool frequently saturated")
        } else if stats.utilization() >= 90.0 {
            ComponentHealth::degraded(self.name()).with_message("Dispatch pool near capacity")
        } else {
            ComponentHealth::healthy(self.name())
        };
        health
            .with_metadata("utilization", stats.utilization())
            .with_metadata("successRate", stats.success_rate())
            .with_metadata("stats", stats)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Guards
// ═══════════════════════════════════════════════════════════════════════════════

/// Memory headroom plus consecutive invocation timeouts.
pub struct PluginGuardHealthChecker {
    manager: Arc<PluginManager>,
}

impl PluginGuardHealthChecker {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl HealthChecker for PluginGuardHealthChecker {
    fn name(&self) -> &str {
        "plugins"
    }

    async fn check(&self) -> ComponentHealth {
        let memory = self.manager.memory_guard();
        let timeouts = self.manager.timeout_guard();
        let available = memory.available_bytes();
        let timeout_count = timeouts.timeout_count();

        let health = if available < memory.threshold() {
            ComponentHealth::unhealthy(self.name()).with_error(format!(
                "available memory {} bytes at or below threshold {}",
                available,
                memory.threshold()
            ))
        } else if timeout_count > 0 {
            ComponentHealth::degraded(self.name()).with_message(format!(
                "{} consecutive invocation timeouts (limit {})",
                timeout_count,
                timeouts.max_timeouts()
            ))
        } else {
            ComponentHealth::healthy(self.name())
        };

        health
            .with_metadata("availableBytes", available)
            .with_metadata("thresholdBytes", memory.threshold())
            .with_metadata("timeoutCount", timeout_count)
            .with_metadata("reclaims", memory.reclaims())
    }
}
