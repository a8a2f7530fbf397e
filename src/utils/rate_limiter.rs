//! Per-client rate limiter
//!
//! Sliding 60-second window over request timestamps, keyed by client
//! identity (IP). Entries are pruned on every check, so idle clients
//! cost nothing after a minute.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    requests_per_minute: usize,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self { requests_per_minute, hits: DashMap::new() }
    }

    /// Register a request from `client`. Returns false when the client has
    /// exhausted its window.
    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> bool {
        let mut entry = self.hits.entry(client.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.len() >= self.requests_per_minute {
            return false;
        }
        entry.push(now);
        true
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.1"));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.2"));
        assert!(!limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.2"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_window_expiry_restores_budget() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.check_at("c", start));
        assert!(limiter.check_at("c", start));
        assert!(!limiter.check_at("c", start + Duration::from_secs(30)));
        // Both earlier hits age out of the window.
        assert!(limiter.check_at("c", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.check("10.0.0.1"));
    }
}
