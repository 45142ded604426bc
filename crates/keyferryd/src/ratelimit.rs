use dashmap::DashMap;
use std::net::IpAddr;

/// Upper bound on tracked origins before stale buckets are swept.
const MAX_TRACKED_ORIGINS: usize = 4096;

/// Per-origin counter for the current window.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start_ms: u64,
    count: u32,
}

/// Fixed-window request limiter keyed by client IP.
///
/// Each origin gets `limit` admissions per `window_ms`. The bucket resets the
/// first time it is touched after the window has elapsed. Checks run before any
/// decryption so a flood of garbage costs only a map lookup.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    limit: u32,
    window_ms: u64,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` requests per `window_ms` per origin.
    #[must_use]
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            limit,
            window_ms,
        }
    }

    /// Counts one request from `origin` and reports whether it is admitted.
    ///
    /// Rejected requests are not counted.
    pub fn check(&self, origin: IpAddr, now_ms: u64) -> bool {
        if self.buckets.len() > MAX_TRACKED_ORIGINS {
            self.prune(now_ms);
        }

        let mut entry = self.buckets.entry(origin).or_insert(Bucket {
            window_start_ms: now_ms,
            count: 0,
        });
        let bucket = entry.value_mut();
        if now_ms.saturating_sub(bucket.window_start_ms) >= self.window_ms {
            bucket.window_start_ms = now_ms;
            bucket.count = 0;
        }
        if bucket.count >= self.limit {
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Drops buckets whose window has elapsed.
    pub fn prune(&self, now_ms: u64) {
        let window = self.window_ms;
        self.buckets
            .retain(|_, b| now_ms.saturating_sub(b.window_start_ms) < window);
    }

    /// Number of origins currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
