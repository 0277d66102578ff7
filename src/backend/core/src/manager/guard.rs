//! Self-protection: invocation deadlines, memory headroom and process exit.
//!
//! Both guards terminate the process through an injected [`ExitStrategy`]
//! once they give up, relying on external orchestration to restart it.

use metrics::counter;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{GsmError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Exit Strategy
// ═══════════════════════════════════════════════════════════════════════════════

pub trait ExitStrategy: Send + Sync {
    fn exit(&self, reason: &str, code: i32);
}

/// Terminates the process.
pub struct ProcessExit;

impl ExitStrategy for ProcessExit {
    fn exit(&self, reason: &str, code: i32) {
        error!(reason = %reason, code, "Terminating process");
        std::process::exit(code);
    }
}

/// Records exit requests instead of acting on them.
#[derive(Default)]
pub struct RecordingExit {
    reasons: Mutex<Vec<String>>,
}

impl RecordingExit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl ExitStrategy for RecordingExit {
    fn exit(&self, reason: &str, code: i32) {
        warn!(reason = %reason, code, "Exit requested");
        self.reasons.lock().push(reason.to_string());
    }
}

pub const EXIT_TIMEOUTS: i32 = 3;
pub const EXIT_MEMORY: i32 = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// Timeout Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs invocations under a deadline and counts consecutive timeouts.
pub struct TimeoutGuard {
    timeout: Duration,
    max_timeouts: u32,
    timeout_count: AtomicU32,
    tripped: AtomicBool,
    exit: Arc<dyn ExitStrategy>,
}

impl TimeoutGuard {
    pub fn new(timeout: Duration, max_timeouts: u32, exit: Arc<dyn ExitStrategy>) -> Self {
        Self {
            timeout,
            max_timeouts: max_timeouts.max(1),
            timeout_count: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            exit,
        }
    }

    /// Race `work` against the deadline.
    ///
    /// Completing in time resets the timeout count; missing the deadline
    /// adds one and, at the maximum, requests process exit exactly once.
    pub async fn run<F, T>(&self, label: &str, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(value) => {
                self.timeout_count.store(0, Ordering::SeqCst);
                Ok(value)
            }
            Err(_) => {
                self.record_timeout(label);
                Err(GsmError::module_timeout(label, self.timeout.as_secs()))
            }
        }
    }

    fn record_timeout(&self, label: &str) {
        let count = self.timeout_count.fetch_add(1, Ordering::SeqCst) + 1;
        counter!("gsm_module_timeouts_total").increment(1);
        warn!(
            module = %label,
            timeout_count = count,
            max_timeout_count = self.max_timeouts,
            "Module invocation timed out"
        );

        if count >= self.max_timeouts && !self.tripped.swap(true, Ordering::SeqCst) {
            self.exit.exit(
                &format!("{} consecutive module timeouts", count),
                EXIT_TIMEOUTS,
            );
        }
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::SeqCst)
    }

    pub fn max_timeouts(&self) -> u32 {
        self.max_timeouts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Guard
// ═══════════════════════════════════════════════════════════════════════════════

pub trait MemoryProbe: Send + Sync {
    /// Memory still available to the process, in bytes.
    fn available_bytes(&self) -> u64;

    /// Peak resident set size of the process, in bytes.
    fn resident_bytes(&self) -> u64 {
        0
    }
}

/// Reads memory figures from the operating system.
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn available_bytes(&self) -> u64 {
        if let Some(bytes) = meminfo_available() {
            return bytes;
        }
        // SAFETY: sysconf has no preconditions
        let (pages, page_size) = unsafe {
            (
                libc::sysconf(libc::_SC_AVPHYS_PAGES),
                libc::sysconf(libc::_SC_PAGESIZE),
            )
        };
        if pages < 0 || page_size < 0 {
            return u64::MAX;
        }
        (pages as u64).saturating_mul(page_size as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn available_bytes(&self) -> u64 {
        u64::MAX
    }

    #[cfg(unix)]
    fn resident_bytes(&self) -> u64 {
        // SAFETY: getrusage only writes into the zeroed struct we pass
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
            return 0;
        }
        let max_rss = usage.ru_maxrss.max(0) as u64;
        if cfg!(target_os = "macos") {
            max_rss
        } else {
            max_rss * 1024
        }
    }
}

/// `MemAvailable` from `/proc/meminfo`, which counts reclaimable page cache.
#[cfg(target_os = "linux")]
fn meminfo_available() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

/// Probe returning a settable figure.
pub struct FixedMemoryProbe {
    available: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn available_bytes(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}

/// Refuses work when available memory drops below a threshold.
pub struct MemoryGuard {
    threshold: u64,
    probe: Arc<dyn MemoryProbe>,
    exit: Arc<dyn ExitStrategy>,
    reclaims: AtomicU64,
    tripped: AtomicBool,
}

impl MemoryGuard {
    pub fn new(threshold: u64, probe: Arc<dyn MemoryProbe>, exit: Arc<dyn ExitStrategy>) -> Self {
        Self {
            threshold,
            probe,
            exit,
            reclaims: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// Check headroom, running `reclaim` once before giving up.
    pub fn check(&self, reclaim: impl FnOnce() -> usize) -> Result<()> {
        let available = self.probe.available_bytes();
        if available >= self.threshold {
            return Ok(());
        }

        let freed = reclaim();
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        let after = self.probe.available_bytes();
        warn!(
            available_bytes = available,
            after_reclaim_bytes = after,
            threshold_bytes = self.threshold,
            freed_entries = freed,
            "Memory below threshold, reclaimed caches"
        );

        if after >= self.threshold {
            return Ok(());
        }

        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.exit.exit("available memory below threshold", EXIT_MEMORY);
        }
        Err(GsmError::memory_exhausted(after, self.threshold))
    }

    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    pub fn available_bytes(&self) -> u64 {
        self.probe.available_bytes()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.probe.resident_bytes()
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_guard(max: u32) -> (TimeoutGuard, Arc<RecordingExit>) {
        let exit = Arc::new(RecordingExit::new());
        let guard = TimeoutGuard::new(Duration::from_millis(20), max, exit.clone());
        (guard, exit)
    }

    #[tokio::test]
    async fn test_timeout_increments_by_one_and_success_resets() {
        let (guard, exit) = timeout_guard(5);

        let err = guard
            .run("slow", tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ModuleTimeout);
        assert_eq!(guard.timeout_count(), 1);

        guard.run("fast", async {}).await.unwrap();
        assert_eq!(guard.timeout_count(), 0);
        assert_eq!(exit.count(), 0);
    }

    #[tokio::test]
    async fn test_max_timeouts_exits_exactly_once() {
        let (guard, exit) = timeout_guard(2);

        for _ in 0..4 {
            let _ = guard
                .run("slow", tokio::time::sleep(Duration::from_millis(200)))
                .await;
        }

        assert_eq!(guard.timeout_count(), 4);
        assert_eq!(exit.count(), 1);
    }

    #[test]
    fn test_memory_guard_recovers_after_reclaim() {
        let probe = Arc::new(FixedMemoryProbe::new(10));
        let exit = Arc::new(RecordingExit::new());
        let guard = MemoryGuard::new(100, probe.clone(), exit.clone());

        let p = probe.clone();
        guard
            .check(|| {
                p.set(1_000);
                3
            })
            .unwrap();

        assert_eq!(guard.reclaims(), 1);
        assert_eq!(exit.count(), 0);
    }

    #[test]
    fn test_memory_guard_exits_when_still_short() {
        let probe = Arc::new(FixedMemoryProbe::new(10));
        let exit = Arc::new(RecordingExit::new());
        let guard = MemoryGuard::new(100, probe, exit.clone());

        assert!(guard.check(|| 0).is_err());
        assert!(guard.check(|| 0).is_err());
        assert_eq!(exit.count(), 1);
    }

    #[test]
    fn test_memory_guard_passes_with_headroom() {
        let probe = Arc::new(FixedMemoryProbe::new(1_000));
        let exit = Arc::new(RecordingExit::new());
        let guard = MemoryGuard::new(100, probe, exit.clone());

        guard.check(|| panic!("reclaim must not run")).unwrap();
        assert_eq!(guard.reclaims(), 0);
    }
}
