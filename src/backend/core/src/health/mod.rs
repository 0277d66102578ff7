//! Health checks behind `/health` and the `metrics` health section.

mod check;
mod checker;

pub use check::*;
pub use checker::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Upper bound for any single checker
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
        }
    }
}

pub struct HealthService {
    config: HealthConfig,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    pub fn checker_names(&self) -> Vec<String> {
        self.checkers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every checker concurrently, each under the configured timeout.
    pub async fn check_health(&self) -> HealthReport {
        let timeout = self.config.check_timeout;
        let checks = self.checkers.iter().map(|checker| {
            let checker = Arc::clone(checker);
            async move {
                match tokio::time::timeout(timeout, checker.check()).await {
                    Ok(health) => health,
                    Err(_) => ComponentHealth::unhealthy(checker.name())
                        .with_error("Health check timed out"),
                }
            }
        });

        let components = futures::future::join_all(checks).await;

        HealthReport::new()
            .with_uptime(self.started_at.elapsed())
            .with_components(components)
    }

    pub async fn is_ready(&self) -> bool {
        self.check_health().await.is_operational()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
