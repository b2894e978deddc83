//! Sliding-window request limiter shared by every connection.
//!
//! Windows are keyed by an arbitrary string (user id once authenticated,
//! remote IP before that). Each key's window lives in its own `DashMap`
//! entry, so increment-and-compare happens under that entry's shard lock and
//! concurrent callers never lose updates.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    started_at: Instant,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, RateWindow>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            windows: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background sweeper that purges expired windows.
    pub fn start(self: &std::sync::Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let period = self.window.max(Duration::from_millis(10));
        let limiter = std::sync::Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let purged = limiter.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired rate-limit windows purged");
                }
            }
        }));
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the sweeper and forget every window.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.windows.clear();
    }

    /// Count one request against `key`.
    pub fn consume(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                started_at: now,
            });

        let elapsed = now.saturating_duration_since(window.started_at);
        if elapsed >= self.window {
            window.count = 0;
            window.started_at = now;
        }

        window.count = window.count.saturating_add(1);
        if window.count > self.max_requests {
            let remaining = self
                .window
                .saturating_sub(now.saturating_duration_since(window.started_at));
            let retry_after_ms = remaining.as_millis().max(1) as u64;
            return RateDecision::Limited { retry_after_ms };
        }

        RateDecision::Allowed {
            remaining: self.max_requests - window.count,
        }
    }

    /// Forget a single key's window.
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows whose period has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started_at) < self.window);
        before.saturating_sub(self.windows.len())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
