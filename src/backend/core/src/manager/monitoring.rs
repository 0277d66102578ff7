//! Sliding request-count windows reported under `/metrics`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

use crate::error::{GsmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Http,
    Event,
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Http => "http",
            InvocationKind::Event => "event",
        }
    }
}

/// Parse a window key such as `"30S"`, `"1M"` or `"2H"`.
pub fn parse_window_key(key: &str) -> Result<Duration> {
    let key = key.trim();
    let split = key.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let (amount, unit) = key.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| GsmError::validation(format!("invalid monitoring window: {}", key)))?;
    if amount == 0 {
        return Err(GsmError::validation(format!("monitoring window must be positive: {}", key)));
    }
    let scale = match unit {
        "S" | "s" => 1,
        "M" | "m" => 60,
        "H" | "h" => 3_600,
        _ => return Err(GsmError::validation(format!("invalid monitoring window unit: {}", key))),
    };
    let seconds = amount
        .checked_mul(scale)
        .ok_or_else(|| GsmError::validation(format!("monitoring window too large: {}", key)))?;
    Ok(Duration::from_secs(seconds))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Interval
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    pub key: String,
    pub duration_secs: u64,
    pub http_request_count: u64,
    pub http_total_time_ms: u64,
    pub event_request_count: u64,
    pub event_total_time_ms: u64,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug)]
struct Counters {
    http_request_count: u64,
    http_total_time: Duration,
    event_request_count: u64,
    event_total_time: Duration,
    window_start: DateTime<Utc>,
}

impl Counters {
    fn empty(window_start: DateTime<Utc>) -> Self {
        Self {
            http_request_count: 0,
            http_total_time: Duration::ZERO,
            event_request_count: 0,
            event_total_time: Duration::ZERO,
            window_start,
        }
    }
}

/// One window; counters reset wholesale once the window has elapsed.
#[derive(Debug)]
pub struct MonitoringInterval {
    key: String,
    duration: Duration,
    counters: Mutex<Counters>,
}

impl MonitoringInterval {
    pub fn new(key: impl Into<String>, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            duration,
            counters: Mutex::new(Counters::empty(now)),
        }
    }

    pub fn parse(key: &str, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self::new(key, parse_window_key(key)?, now))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn record_at(&self, kind: InvocationKind, elapsed: Duration, now: DateTime<Utc>) {
        let mut counters = self.counters.lock();
        self.roll(&mut counters, now);
        match kind {
            InvocationKind::Http => {
                counters.http_request_count += 1;
                counters.http_total_time += elapsed;
            }
            InvocationKind::Event => {
                counters.event_request_count += 1;
                counters.event_total_time += elapsed;
            }
        }
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> MonitoringSnapshot {
        let mut counters = self.counters.lock();
        self.roll(&mut counters, now);
        MonitoringSnapshot {
            key: self.key.clone(),
            duration_secs: self.duration.as_secs(),
            http_request_count: counters.http_request_count,
            http_total_time_ms: counters.http_total_time.as_millis() as u64,
            event_request_count: counters.event_request_count,
            event_total_time_ms: counters.event_total_time.as_millis() as u64,
            window_start: counters.window_start,
        }
    }

    fn roll(&self, counters: &mut Counters, now: DateTime<Utc>) {
        let age = now.signed_duration_since(counters.window_start);
        let expired = age
            .to_std()
            .map(|age| age >= self.duration)
            .unwrap_or(false);
        if expired {
            *counters = Counters::empty(now);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor
// ═══════════════════════════════════════════════════════════════════════════════

/// Every configured window, fed by each HTTP and event invocation.
#[derive(Debug)]
pub struct Monitor {
    intervals: Vec<MonitoringInterval>,
}

impl Monitor {
    pub fn new(keys: &[String]) -> Result<Self> {
        let now = Utc::now();
        let intervals = keys
            .iter()
            .map(|key| MonitoringInterval::parse(key, now))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { intervals })
    }

    pub fn record(&self, kind: InvocationKind, elapsed: Duration) {
        let now = Utc::now();
        for interval in &self.intervals {
            interval.record_at(kind, elapsed, now);
        }
    }

    pub fn snapshot(&self) -> Vec<MonitoringSnapshot> {
        let now = Utc::now();
        self.intervals.iter().map(|i| i.snapshot_at(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_key() {
        assert_eq!(parse_window_key("1M").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_window_key("5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_window_key("30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_window_key("2H").unwrap(), Duration::from_secs(7_200));
        assert!(parse_window_key("0M").is_err());
        assert!(parse_window_key("5D").is_err());
        assert!(parse_window_key("").is_err());
    }

    #[test]
    fn test_parse_window_key_rejects_overflow() {
        let err = parse_window_key("9999999999999999H").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
        assert!(parse_window_key("99999999999999999999S").is_err());
        assert_eq!(
            parse_window_key("5124095576030431H").unwrap(),
            Duration::from_secs(5_124_095_576_030_431 * 3_600)
        );
    }

    #[test]
    fn test_window_resets_exactly_at_duration() {
        let start = Utc::now();
        let interval = MonitoringInterval::parse("1M", start).unwrap();

        interval.record_at(InvocationKind::Http, Duration::from_millis(10), start);
        interval.record_at(
            InvocationKind::Event,
            Duration::from_millis(5),
            start + chrono::Duration::seconds(59),
        );

        let before = interval.snapshot_at(start + chrono::Duration::milliseconds(59_999));
        assert_eq!(before.http_request_count, 1);
        assert_eq!(before.event_request_count, 1);

        let after = interval.snapshot_at(start + chrono::Duration::seconds(60));
        assert_eq!(after.http_request_count, 0);
        assert_eq!(after.event_request_count, 0);
        assert_eq!(after.window_start, start + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_windows_roll_independently() {
        let monitor = Monitor::new(&["1M".to_string(), "5M".to_string()]).unwrap();
        monitor.record(InvocationKind::Http, Duration::from_millis(3));

        let later = Utc::now() + chrono::Duration::seconds(90);
        let one = monitor.intervals[0].snapshot_at(later);
        let five = monitor.intervals[1].snapshot_at(later);

        assert_eq!(one.http_request_count, 0);
        assert_eq!(five.http_request_count, 1);
        assert_eq!(five.http_total_time_ms, 3);
    }
}
