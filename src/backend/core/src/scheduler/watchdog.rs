//! Periodic fleet heartbeat.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cloud::{CloudBackend, QueueRef};
use crate::error::Result;

pub struct Watchdog {
    backend: Arc<dyn CloudBackend>,
    location: String,
    instance_id: Uuid,
    queue: Arc<RwLock<QueueRef>>,
    interval: Duration,
    beats: AtomicU64,
    failures: AtomicU64,
}

impl Watchdog {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        location: impl Into<String>,
        instance_id: Uuid,
        queue: Arc<RwLock<QueueRef>>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            location: location.into(),
            instance_id,
            queue,
            interval,
            beats: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Report this instance to the fleet-health hook once.
    pub async fn beat(&self) -> Result<()> {
        let queue = self.queue.read().clone();
        self.backend
            .watchdog(&self.location, self.instance_id, &queue)
            .await?;
        self.beats.fetch_add(1, Ordering::Relaxed);
        debug!(location = %self.location, instance_id = %self.instance_id, "Watchdog heartbeat sent");
        Ok(())
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Beat every interval until `shutdown` fires. Failures are logged and
    /// the next beat runs as scheduled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(location = %self.location, error = %e, "Watchdog heartbeat failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InMemoryCloud, QueueService};

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let cloud = Arc::new(InMemoryCloud::new());
        let queue = cloud.define_queue("gsm-instance-lab-x").await.unwrap();
        let watchdog = Arc::new(Watchdog::new(
            cloud.clone() as Arc<dyn CloudBackend>,
            "lab",
            Uuid::new_v4(),
            Arc::new(RwLock::new(queue)),
            Duration::from_millis(10),
        ));

        cloud.set_watchdog_failing(true);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&watchdog).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cloud.set_watchdog_failing(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(watchdog.failures() >= 1);
        assert!(watchdog.beats() >= 1);
    }
}
