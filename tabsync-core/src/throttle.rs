//! Bandwidth pacing, heartbeat scheduling and session liveness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tabsync_types::DEFAULT_BANDWIDTH;
use tokio::time::Instant;

/// Idle time after which a publisher sends a heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Sleep between replication rescans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Keeps sustained throughput under a bytes-per-second ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    bandwidth: u64,
}

impl Throttle {
    /// Create a throttle. Zero falls back to the default ceiling.
    pub fn new(bandwidth: u64) -> Self {
        let bandwidth = if bandwidth == 0 {
            DEFAULT_BANDWIDTH
        } else {
            bandwidth
        };
        Self { bandwidth }
    }

    /// Ceiling in bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    /// Shortest time `bytes` may take on the wire.
    pub fn min_transmit_time(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bandwidth as f64)
    }

    /// Time left to wait after a send that began at `started`.
    pub fn remaining(&self, started: Instant, bytes: usize, now: Instant) -> Duration {
        self.min_transmit_time(bytes)
            .saturating_sub(now.saturating_duration_since(started))
    }

    /// Sleep off whatever part of the minimum transmit time is left.
    pub async fn pace(&self, started: Instant, bytes: usize) {
        let wait = self.remaining(started, bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_BANDWIDTH)
    }
}

/// Tracks when a heartbeat is owed.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTimer {
    interval: Duration,
    last_sent: Instant,
}

impl HeartbeatTimer {
    /// Start the timer now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Instant::now(),
        }
    }

    /// Record that something was sent.
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// True once nothing has been sent for longer than the interval.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }
}

/// Last-activity timestamp of a session, readable by liveness monitors.
#[derive(Debug)]
pub struct SessionActivity {
    last_ms: AtomicU64,
}

impl SessionActivity {
    /// Create a record stamped with the current time.
    pub fn new() -> Self {
        Self {
            last_ms: AtomicU64::new(wall_millis()),
        }
    }

    /// Stamp the current time.
    pub fn touch(&self) {
        self.last_ms.store(wall_millis(), Ordering::Relaxed);
    }

    /// Last activity in Unix milliseconds.
    pub fn last_millis(&self) -> u64 {
        self.last_ms.load(Ordering::Relaxed)
    }

    /// Time since the last activity.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(wall_millis().saturating_sub(self.last_millis()))
    }
}

impl Default for SessionActivity {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
