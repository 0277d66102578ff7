//! Bounded pool that runs dispatched messages.
//!
//! Listeners acquire a permit before handing a message over, so a saturated
//! pool slows polling down instead of piling up tasks.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::{GsmError, Result};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub max_workers: usize,
    pub acquire_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "dispatch".to_string(),
            max_workers: 32,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            name: "dispatch".to_string(),
            max_workers: config.worker_threads.max(1),
            acquire_timeout: config.acquire_timeout,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    acquire_timeouts: AtomicU64,
    total_wait_us: AtomicU64,
    total_exec_us: AtomicU64,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolStats {
    fn record_acquire(&self, wait: Duration) {
        self.total_wait_us
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
        let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    fn record_finish(&self, success: bool, exec: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_exec_us
            .fetch_add(exec.as_micros() as u64, Ordering::Relaxed);
        self.current.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: usize,
    pub active_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub acquire_timeouts: u64,
    pub peak_concurrent: usize,
    pub avg_wait_time_us: u64,
    pub avg_exec_time_us: u64,
    pub uptime_secs: u64,
}

impl WorkerPoolStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_succeeded + self.tasks_failed;
        if total == 0 {
            100.0
        } else {
            (self.tasks_succeeded as f64 / total as f64) * 100.0
        }
    }

    pub fn utilization(&self) -> f64 {
        (self.active_workers as f64 / self.max_workers.max(1) as f64) * 100.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Permit held by one running task; released on drop.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    started_at: Instant,
    finished: bool,
}

impl WorkerPermit {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.stats.record_finish(success, self.started_at.elapsed());
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.record_finish(false, self.started_at.elapsed());
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        tracing::info!(
            pool_name = %config.name,
            max_workers = config.max_workers,
            "Worker pool created"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            stats: Arc::new(PoolStats::default()),
            tasks: Mutex::new(Vec::new()),
            created_at: Instant::now(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.semaphore.available_permits()
    }

    async fn acquire(&self) -> Result<WorkerPermit> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool_name = %self.config.name,
                timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                "Worker permit acquire timed out"
            );
            GsmError::internal(format!(
                "worker pool '{}' saturated for {:?}",
                self.config.name, self.config.acquire_timeout
            ))
        })?
        .map_err(|_| GsmError::internal(format!("worker pool '{}' is closed", self.config.name)))?;

        self.stats.record_acquire(start.elapsed());
        Ok(WorkerPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
            started_at: Instant::now(),
            finished: false,
        })
    }

    /// Run `work` inline under a permit.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        let result = work.await;
        permit.finish(result.is_ok());
        result
    }

    /// Wait for a permit, then run `work` in the background.
    ///
    /// Returns once the task is spawned; an error means no permit became
    /// available within the acquire timeout.
    pub async fn submit<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = self.acquire().await?;
        let handle = tokio::spawn(async move {
            let result = work.await;
            permit.finish(result.is_ok());
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Wait for background tasks, aborting whatever is left after `grace`.
    pub async fn drain(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let deadline = tokio::time::Instant::now() + grace;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!(pool_name = %self.config.name, "Worker pool drained");
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let stats = &self.stats;
        let submitted = stats.submitted.load(Ordering::Relaxed);
        let succeeded = stats.succeeded.load(Ordering::Relaxed);
        let failed = stats.failed.load(Ordering::Relaxed);
        let completed = succeeded + failed;

        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            active_workers: self.active_workers(),
            tasks_submitted: submitted,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            acquire_timeouts: stats.acquire_timeouts.load(Ordering::Relaxed),
            peak_concurrent: stats.peak.load(Ordering::Relaxed),
            avg_wait_time_us: stats
                .total_wait_us
                .load(Ordering::Relaxed)
                .checked_div(submitted)
                .unwrap_or(0),
            avg_exec_time_us: stats
                .total_exec_us
                .load(Ordering::Relaxed)
                .checked_div(completed)
                .unwrap_or(0),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Healthy while acquire timeouts stay under 10% of submissions.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();
        if stats.tasks_submitted == 0 {
            return true;
        }
        (stats.acquire_timeouts as f64 / stats.tasks_submitted as f64) < 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_workers: usize, acquire_timeout: Duration) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            name: "test".into(),
            max_workers,
            acquire_timeout,
        })
    }

    #[tokio::test]
    async fn test_run_records_outcome() {
        let pool = pool(2, Duration::from_secs(1));

        assert_eq!(pool.run(async { Ok::<_, GsmError>(42) }).await.unwrap(), 42);
        assert!(pool
            .run(async { Err::<(), _>(GsmError::internal("boom")) })
            .await
            .is_err());

        let stats = pool.stats();
        assert_eq!(stats.tasks_submitted, 2);
        assert_eq!(stats.tasks_succeeded, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.success_rate(), 50.0);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_submit_times_out_when_saturated() {
        let pool = pool(1, Duration::from_millis(50));

        pool.submit(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await
        .unwrap();

        assert!(pool.submit(async { Ok(()) }).await.is_err());
        assert_eq!(pool.stats().acquire_timeouts, 1);

        pool.drain(Duration::from_millis(10)).await;
    }
}
