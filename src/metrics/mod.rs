//! # Metrics Aggregator
//!
//! In-process request counters and latency extremes, updated from any number
//! of tasks without a lock. Counters are plain atomic increments; the
//! minimum and maximum use compare-and-swap retry loops. The average is
//! derived when a snapshot is taken and never stored.
//!
//! Everything resets on restart.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free request statistics
#[derive(Debug)]
pub struct MetricsRegistry {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
    /// Epoch milliseconds of the latest sample, 0 before any
    last_activity_ms: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Record one finished request
    pub fn record(&self, success: bool, duration_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        update_extreme(&self.min_duration_ms, duration_ms, |candidate, current| {
            candidate < current
        });
        update_extreme(&self.max_duration_ms, duration_ms, |candidate, current| {
            candidate > current
        });

        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        update_extreme(&self.last_activity_ms, now_ms, |candidate, current| {
            candidate > current
        });
    }

    /// Point-in-time view of the counters
    ///
    /// Fields are read individually, so a snapshot taken under load may mix
    /// values from adjacent samples.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let total_duration = self.total_duration_ms.load(Ordering::Relaxed);
        let min = self.min_duration_ms.load(Ordering::Relaxed);
        let last = self.last_activity_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total,
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            avg_ms: if total == 0 {
                0.0
            } else {
                total_duration as f64 / total as f64
            },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_duration_ms.load(Ordering::Relaxed),
            last_activity: i64::try_from(last)
                .ok()
                .filter(|ms| *ms > 0)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }

    /// Body served by the `/metrics` endpoint
    pub fn to_json(&self, secure_mode: bool) -> serde_json::Value {
        MetricsReport::new(&self.snapshot(), secure_mode).to_json()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn update_extreme(slot: &AtomicU64, candidate: u64, replaces: impl Fn(u64, u64) -> bool) {
    let mut current = slot.load(Ordering::Relaxed);
    while replaces(candidate, current) {
        match slot.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Values read from a [`MetricsRegistry`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub avg_ms: f64,
    /// 0 before any sample
    pub min_ms: u64,
    pub max_ms: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsReport {
    total_requests: u64,
    success_requests: u64,
    failure_requests: u64,
    avg_duration_ms: f64,
    min_duration_ms: u64,
    max_duration_ms: u64,
    secure_mode: bool,
    last_request_at: String,
}

impl MetricsReport {
    fn new(snapshot: &MetricsSnapshot, secure_mode: bool) -> Self {
        Self {
            total_requests: snapshot.total,
            success_requests: snapshot.success,
            failure_requests: snapshot.failure,
            avg_duration_ms: snapshot.avg_ms,
            min_duration_ms: snapshot.min_ms,
            max_duration_ms: snapshot.max_ms,
            secure_mode,
            last_request_at: snapshot
                .last_activity
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.min_ms, 0);
        assert_eq!(snapshot.max_ms, 0);
        assert_eq!(snapshot.avg_ms, 0.0);
        assert!(snapshot.last_activity.is_none());
    }

    #[test]
    fn test_record_updates_counters() {
        let metrics = MetricsRegistry::new();
        metrics.record(true, 10);
        metrics.record(false, 30);
        metrics.record(true, 20);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.success, 2);
        assert_eq!(snapshot.failure, 1);
        assert_eq!(snapshot.min_ms, 10);
        assert_eq!(snapshot.max_ms, 30);
        assert!((snapshot.avg_ms - 20.0).abs() < f64::EPSILON);
        assert!(snapshot.last_activity.is_some());
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        metrics.record(i % 2 == 0, t * 1000 + i + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 8000);
        assert_eq!(snapshot.success + snapshot.failure, 8000);
        assert_eq!(snapshot.min_ms, 1);
        assert_eq!(snapshot.max_ms, 8000);
    }

    #[test]
    fn test_json_report_keys() {
        let metrics = MetricsRegistry::new();
        let empty = metrics.to_json(false);
        assert_eq!(empty["lastRequestAt"], "");
        assert_eq!(empty["minDurationMs"], 0);

        metrics.record(true, 5);
        let json = metrics.to_json(true);
        assert_eq!(json["totalRequests"], 1);
        assert_eq!(json["successRequests"], 1);
        assert_eq!(json["failureRequests"], 0);
        assert_eq!(json["maxDurationMs"], 5);
        assert_eq!(json["secureMode"], true);
        assert!(json["lastRequestAt"].as_str().unwrap().ends_with('Z'));
        assert!(json.get("avgDurationMs").is_some());
    }
}
