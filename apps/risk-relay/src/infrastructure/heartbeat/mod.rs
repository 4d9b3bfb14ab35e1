//! Keep-Alive and Read Deadlines
//!
//! Both the viewer transport and the upstream link ping their peer every
//! `ping_period` and drop the connection when nothing has been heard for
//! `pong_wait`. Every inbound frame refreshes the deadline, pongs included.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Keep-alive timing shared by viewer sessions and the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// Silence tolerated before the peer is considered gone.
    pub pong_wait: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
        }
    }
}

impl KeepAliveConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(write_wait: Duration, pong_wait: Duration) -> Self {
        Self {
            write_wait,
            pong_wait,
        }
    }

    /// Ping cadence, nine tenths of `pong_wait`.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait * 9 / 10).max(Duration::from_millis(1))
    }
}

/// Liveness state of one connection.
#[derive(Debug)]
pub struct HeartbeatState {
    last_seen: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create state for a fresh connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Record that the peer answered or sent anything.
    pub fn record_pong(&self) {
        *self.last_seen.write() = Instant::now();
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Mark that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is unanswered.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the peer was last heard from.
    #[must_use]
    pub fn time_since_pong(&self) -> Duration {
        self.last_seen.read().elapsed()
    }

    /// Point in time after which a read should be abandoned.
    #[must_use]
    pub fn read_deadline(&self, pong_wait: Duration) -> tokio::time::Instant {
        tokio::time::Instant::from_std(*self.last_seen.read() + pong_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = KeepAliveConfig::default();
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.ping_period(), Duration::from_secs(54));
    }

    #[test]
    fn ping_period_is_never_zero() {
        let config = KeepAliveConfig::new(Duration::from_secs(1), Duration::ZERO);
        assert!(config.ping_period() > Duration::ZERO);
    }

    #[test]
    fn pong_clears_waiting_flag() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());
        state.record_pong();
        assert!(!state.is_waiting_for_pong());
        assert!(state.time_since_pong() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn read_deadline_moves_with_activity() {
        let state = HeartbeatState::new();
        let wait = Duration::from_secs(5);
        let first = state.read_deadline(wait);
        tokio::time::sleep(Duration::from_millis(5)).await;
        state.record_pong();
        assert!(state.read_deadline(wait) > first);
    }
}
