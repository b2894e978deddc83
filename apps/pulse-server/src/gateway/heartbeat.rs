//! Per-connection application-level liveness checks.
//!
//! Every tick the monitor either sends a fresh ping or, when the previous
//! ping was never answered, declares the connection dead. The effective
//! timeout is therefore exactly one interval.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Shortest period a ticker will run at; `interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What the owning actor must do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send `{type:"ping", timestamp}`.
    SendPing(i64),
    /// The last ping went unanswered; close with `heartbeat_timeout`.
    TimedOut,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    /// Timestamp (ms) stamped on the last ping sent; 0 before the first.
    last_ping_at: i64,
    /// Timestamp (ms) echoed by the last pong; 0 before the first.
    last_pong_at: i64,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            last_ping_at: 0,
            last_pong_at: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_ping_at(&self) -> i64 {
        self.last_ping_at
    }

    pub fn last_pong_at(&self) -> i64 {
        self.last_pong_at
    }

    /// Ticker for the actor loop. The first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub fn on_tick(&mut self, now_ms: i64) -> HeartbeatAction {
        if self.last_ping_at > 0 && self.last_pong_at < self.last_ping_at {
            return HeartbeatAction::TimedOut;
        }
        // Two ticks within the same millisecond must still be distinguishable.
        let stamp = now_ms.max(self.last_ping_at + 1);
        self.last_ping_at = stamp;
        HeartbeatAction::SendPing(stamp)
    }

    /// Record a pong. The echoed timestamp is used rather than the local
    /// receive time, which tolerates clock skew within a single tick.
    pub fn record_pong(&mut self, echoed_timestamp: i64) {
        self.last_pong_at = self.last_pong_at.max(echoed_timestamp);
    }
}
