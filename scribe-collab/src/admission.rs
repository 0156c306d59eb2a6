//! Per-address admission control for websocket upgrades.
//!
//! Fixed-window token bucket keyed by client IP: each address gets `max`
//! upgrades per `window`, after which further attempts are refused with
//! HTTP 429 until the window rolls over. The buckets belong to one server
//! instance; nothing is process-global.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Bucket size and window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    started: Instant,
    tokens: u32,
}

#[derive(Debug)]
pub struct AdmissionControl {
    limit: RateLimit,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl AdmissionControl {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take a token for `ip`. Returns `false` if the address is over its
    /// budget for the current window.
    pub fn check(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            started: now,
            tokens: self.limit.max,
        });
        if now.saturating_duration_since(bucket.started) > self.limit.window {
            bucket.started = now;
            bucket.tokens = self.limit.max;
        }
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Drop buckets whose window has expired. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.started) <= self.limit.window);
        before - buckets.len()
    }

    /// Number of tracked addresses.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn limiter(max: u32) -> AdmissionControl {
        AdmissionControl::new(RateLimit {
            max,
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_budget_per_address() {
        let ac = limiter(2);
        let now = Instant::now();

        assert!(ac.check(A, now));
        assert!(ac.check(A, now));
        assert!(!ac.check(A, now));
        // Another address has its own bucket.
        assert!(ac.check(B, now));
    }

    #[test]
    fn test_window_rolls_over() {
        let ac = limiter(1);
        let now = Instant::now();

        assert!(ac.check(A, now));
        assert!(!ac.check(A, now + Duration::from_secs(30)));
        assert!(ac.check(A, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_prune_stale_buckets() {
        let ac = limiter(5);
        let now = Instant::now();
        ac.check(A, now);
        ac.check(B, now + Duration::from_secs(50));

        assert_eq!(ac.prune(now + Duration::from_secs(70)), 1);
        assert_eq!(ac.tracked(), 1);
    }

    #[test]
    fn test_zero_budget_rejects_everything() {
        let ac = limiter(0);
        assert!(!ac.check(A, Instant::now()));
    }
}
