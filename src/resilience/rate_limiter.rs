//! Per-key call limiter for manually triggered probes
//!
//! Each key keeps the timestamps of its calls inside the window; a call is
//! admitted while fewer than `max_calls` of them are still live.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitSettings;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_calls: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_calls: 10,
        }
    }
}

impl RateLimiterConfig {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            window: Duration::from_secs(settings.window_sec),
            max_calls: settings.max_calls,
        }
    }
}

/// Rate limiter state shared across callers
pub struct RateLimiter {
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record a call for `key` if capacity remains
    pub fn is_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, Instant::now())
    }

    pub(crate) fn is_allowed_at(&self, key: &str, now: Instant) -> bool {
        let mut calls = self.calls.lock();
        let window = calls.entry(key.to_string()).or_default();
        self.evict(window, now);

        if window.len() >= self.config.max_calls {
            debug!(key = key, limit = self.config.max_calls, "Rate limit reached");
            return false;
        }
        window.push_back(now);
        true
    }

    /// Calls still available to `key` in the current window
    pub fn remaining(&self, key: &str) -> usize {
        self.remaining_at(key, Instant::now())
    }

    pub(crate) fn remaining_at(&self, key: &str, now: Instant) -> usize {
        let mut calls = self.calls.lock();
        match calls.get_mut(key) {
            Some(window) => {
                self.evict(window, now);
                self.config.max_calls.saturating_sub(window.len())
            }
            None => self.config.max_calls,
        }
    }

    /// Drop keys without live timestamps; returns how many were removed
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub(crate) fn purge_idle_at(&self, now: Instant) -> usize {
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, window| {
            self.evict(window, now);
            !window.is_empty()
        });
        before - calls.len()
    }

    fn evict(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("keys", &self.calls.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(window_secs),
            max_calls,
        })
    }

    #[test]
    fn test_rejects_call_over_limit() {
        let rl = limiter(3, 60);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.is_allowed_at("svc", now));
        }
        assert!(!rl.is_allowed_at("svc", now));
        assert_eq!(rl.remaining_at("svc", now), 0);
    }

    #[test]
    fn test_capacity_returns_after_window() {
        let rl = limiter(2, 10);
        let start = Instant::now();
        assert!(rl.is_allowed_at("svc", start));
        assert!(rl.is_allowed_at("svc", start + Duration::from_secs(4)));
        assert!(!rl.is_allowed_at("svc", start + Duration::from_secs(9)));

        // The first call leaves the window, freeing exactly one slot
        assert!(rl.is_allowed_at("svc", start + Duration::from_secs(10)));
        assert!(!rl.is_allowed_at("svc", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_keys_are_independent() {
        let rl = limiter(1, 60);
        assert!(rl.is_allowed("a"));
        assert!(!rl.is_allowed("a"));
        assert!(rl.is_allowed("b"));
        assert_eq!(rl.remaining("c"), 1);
    }

    #[test]
    fn test_purge_idle_keys() {
        let rl = limiter(5, 60);
        let start = Instant::now();
        assert!(rl.is_allowed_at("stale", start));
        assert!(rl.is_allowed_at("fresh", start + Duration::from_secs(100)));

        let later = start + Duration::from_secs(120);
        assert_eq!(rl.purge_idle_at(later), 1);
        assert_eq!(rl.remaining_at("fresh", later), 4);
        assert_eq!(rl.purge_idle_at(later), 0);
    }
}
