//! # Fixed-Window Rate Limiter
//!
//! One `(window_start, count)` pair per key. A call is admitted while the
//! count is below the configured maximum; the count resets once the window
//! duration has elapsed. Bursts of up to twice the limit across a window
//! boundary are accepted in exchange for O(1) bookkeeping per key.
//!
//! ## Concurrency
//!
//! The key map is a sharded [`DashMap`]; each window has its own mutex, held
//! only for the check-and-increment of that key. The map shard guard is
//! released before the window lock is taken, so unrelated keys never contend.
//!
//! Idle windows (untouched for more than two window durations) are swept at
//! most once per window. The sweep first scans the map under shard read
//! guards, skipping windows whose lock is currently held, then removes each
//! idle key with `remove_if`, which write-locks only the shard owning that
//! key. At most one shard is write-locked at any point of the sweep.
//!
//! The sweeper marks a window as evicted under that window's own lock and
//! re-checks idleness there; a caller that raced with the sweep sees the mark
//! and retries against a fresh window, so an admitted call is never lost.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u64,
    evicted: bool,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            start: now,
            count: 0,
            evicted: false,
        }
    }
}

/// Per-key fixed-window admission control
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: i64,
    window: Duration,
    windows: DashMap<String, Arc<Mutex<Window>>>,
    origin: Instant,
    last_sweep_ms: AtomicU64,
}

impl RateLimiter {
    /// Limit each key to `max_requests` per `window`
    ///
    /// A `max_requests` of zero or below disables limiting entirely.
    pub fn new(max_requests: i64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
            origin: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }

    pub fn max_requests(&self) -> i64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Try to admit one call for `key`
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// Try to admit one call for `key` at the instant `now`
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.maybe_sweep(now);

        let max = u64::try_from(self.max_requests).unwrap_or(u64::MAX);
        loop {
            let slot = self
                .windows
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window::new(now))))
                .value()
                .clone();

            let mut window = lock(&slot);
            if window.evicted {
                // swept between lookup and lock; the next lookup inserts a new window
                continue;
            }
            if now.saturating_duration_since(window.start) >= self.window {
                window.start = now;
                window.count = 0;
            }
            if window.count < max {
                window.count += 1;
                return true;
            }
            return false;
        }
    }

    /// Drop windows idle for more than twice the window duration
    ///
    /// Runs at most once per window; concurrent callers skip it.
    fn maybe_sweep(&self, now: Instant) {
        let now_ms = millis_since(self.origin, now);
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < window_ms {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let idle_limit = self.window.saturating_mul(2);
        let is_idle = |window: &Window| now.saturating_duration_since(window.start) > idle_limit;

        // a window whose lock is held is in use right now
        let candidates: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(window) => is_idle(&*window),
                Err(TryLockError::Poisoned(poisoned)) => is_idle(&*poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => false,
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0usize;
        for key in candidates {
            let removed = self.windows.remove_if(&key, |_, slot| {
                let mut window = lock(slot);
                if is_idle(&*window) {
                    window.evicted = true;
                    true
                } else {
                    false
                }
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.windows.len(), "Evicted idle rate-limit windows");
        }
    }
}

fn lock(slot: &Mutex<Window>) -> MutexGuard<'_, Window> {
    // a poisoned window only means a panic mid-update; the counters are still usable
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn millis_since(origin: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(origin).as_millis()).unwrap_or(u64::MAX)
}
