//! Windowed rate limiting, one budget per connection.
//!
//! Each identity carries `{ count, window_start }`. A check admits and
//! bumps the count while the window is live, or resets the window and
//! admits once it has elapsed. Identifiers are synthetic per-connection
//! tokens, so two connections from the same agent consume independent
//! budgets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window_ms: std::env::var("COOP_RATE_LIMIT_WINDOW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.window_ms),
            max_requests: std::env::var("COOP_RATE_LIMIT_MAX_REQUESTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_requests),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    window_start: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Windowed limiter keyed by caller-supplied identifier.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `id`. Rejection is a boolean,
    /// not an error, and does not mutate the window.
    pub fn check_limit(&self, id: &str) -> bool {
        self.check_limit_at(id, now_ms())
    }

    fn check_limit_at(&self, id: &str, now: u64) -> bool {
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(id) {
            None => {
                windows.insert(
                    id.to_string(),
                    Window {
                        count: 1,
                        window_start: now,
                    },
                );
                true
            }
            Some(window) if now.saturating_sub(window.window_start) > self.config.window_ms => {
                window.count = 1;
                window.window_start = now;
                true
            }
            Some(window) if window.count < self.config.max_requests => {
                window.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Requests left in the current window. An expired window reads as
    /// a fresh one without being reset.
    pub fn get_remaining_requests(&self, id: &str) -> u64 {
        self.remaining_at(id, now_ms())
    }

    fn remaining_at(&self, id: &str, now: u64) -> u64 {
        let windows = self.windows.lock().unwrap();
        match windows.get(id) {
            Some(window) if now.saturating_sub(window.window_start) <= self.config.window_ms => {
                self.config.max_requests.saturating_sub(window.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Milliseconds until the window for `id` resets; zero when expired
    /// or untracked.
    pub fn get_time_until_reset(&self, id: &str) -> u64 {
        self.reset_in_at(id, now_ms())
    }

    fn reset_in_at(&self, id: &str, now: u64) -> u64 {
        let windows = self.windows.lock().unwrap();
        match windows.get(id) {
            Some(window) => (window.window_start + self.config.window_ms).saturating_sub(now),
            None => 0,
        }
    }

    /// Drop the window for a departed identity.
    pub fn reset_client(&self, id: &str) {
        self.windows.lock().unwrap().remove(id);
    }

    /// Sweep expired windows. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let now = now_ms();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, w| now.saturating_sub(w.window_start) <= self.config.window_ms);
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

/// Wraps [`RateLimiter`] with synthetic per-connection identifiers, so
/// a budget covers exactly one connection's lifetime.
pub struct ConnectionRateLimiter {
    limiter: RateLimiter,
    next_seq: AtomicU64,
}

impl ConnectionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Mint an identifier for a new connection.
    pub fn connection_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("conn_{seq}_{}", now_ms())
    }

    pub fn check_limit(&self, connection_id: &str) -> bool {
        self.limiter.check_limit(connection_id)
    }

    pub fn get_remaining_requests(&self, connection_id: &str) -> u64 {
        self.limiter.get_remaining_requests(connection_id)
    }

    pub fn release(&self, connection_id: &str) {
        self.limiter.reset_client(connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_ms: u64, max_requests: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_ms,
            max_requests,
        })
    }

    #[test]
    fn admits_up_to_cap_then_rejects() {
        let limiter = limiter(60_000, 5);
        for _ in 0..5 {
            assert!(limiter.check_limit_at("c1", 1_000));
        }
        assert!(!limiter.check_limit_at("c1", 1_000));
        assert_eq!(limiter.remaining_at("c1", 1_000), 0);
    }

    #[test]
    fn elapsed_window_resets_and_admits() {
        let limiter = limiter(1_000, 2);
        assert!(limiter.check_limit_at("c1", 0));
        assert!(limiter.check_limit_at("c1", 500));
        assert!(!limiter.check_limit_at("c1", 900));
        assert!(limiter.check_limit_at("c1", 1_500));
        assert_eq!(limiter.remaining_at("c1", 1_500), 1);
    }

    #[test]
    fn rejection_does_not_mutate_the_window() {
        let limiter = limiter(1_000, 1);
        assert!(limiter.check_limit_at("c1", 0));
        for t in [100, 300, 900] {
            assert!(!limiter.check_limit_at("c1", t));
        }
        assert!(limiter.check_limit_at("c1", 1_500));
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = limiter(60_000, 1);
        assert!(limiter.check_limit_at("c1", 0));
        assert!(limiter.check_limit_at("c2", 0));
        assert!(!limiter.check_limit_at("c1", 0));
    }

    #[test]
    fn expired_window_reads_as_full_budget() {
        let limiter = limiter(1_000, 3);
        assert!(limiter.check_limit_at("c1", 0));
        assert_eq!(limiter.remaining_at("c1", 500), 2);
        assert_eq!(limiter.remaining_at("c1", 2_000), 3);
    }

    #[test]
    fn time_until_reset_counts_down() {
        let limiter = limiter(1_000, 3);
        assert_eq!(limiter.reset_in_at("c1", 0), 0);
        assert!(limiter.check_limit_at("c1", 100));
        assert_eq!(limiter.reset_in_at("c1", 600), 500);
        assert_eq!(limiter.reset_in_at("c1", 2_000), 0);
    }

    #[test]
    fn reset_client_drops_tracking() {
        let limiter = limiter(60_000, 1);
        assert!(limiter.check_limit_at("c1", 0));
        assert_eq!(limiter.tracked(), 1);
        limiter.reset_client("c1");
        assert_eq!(limiter.tracked(), 0);
        assert!(limiter.check_limit_at("c1", 0));
    }

    #[test]
    fn cleanup_sweeps_only_expired_windows() {
        let limiter = limiter(60_000, 5);
        assert!(limiter.check_limit("live"));
        limiter
            .windows
            .lock()
            .unwrap()
            .insert("stale".to_string(), Window { count: 3, window_start: 0 });
        limiter.cleanup();
        let windows = limiter.windows.lock().unwrap();
        assert!(windows.contains_key("live"));
        assert!(!windows.contains_key("stale"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let limiter = ConnectionRateLimiter::new(RateLimitConfig::default());
        let a = limiter.connection_id();
        let b = limiter.connection_id();
        assert_ne!(a, b);
        assert!(a.starts_with("conn_0_"));
        assert!(b.starts_with("conn_1_"));
    }
}
