//! Admission limits for tabsync-server.
//!
//! Two checks run on every accepted socket before the handshake starts:
//! - a per-IP connection rate, using governor's keyed limiter backed by DashMap
//! - a cap on concurrent sessions, using a semaphore whose permit lives as
//!   long as the connection task

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Admission limits for the server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per peer IP.
    ///
    /// Configured via `limits.connections_per_minute`.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// One permit per live session.
    ///
    /// Configured via `limits.max_concurrent_sessions`.
    session_slots: Arc<Semaphore>,

    max_sessions: usize,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("sessions_available", &self.session_slots.available_permits())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

impl RateLimits {
    /// Create limits from configuration.
    ///
    /// Zero values are rejected by [`Config::validate`](crate::config::Config::validate);
    /// if one slips through it is treated as one.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.connections_per_minute).unwrap_or(NonZeroU32::MIN);
        let max_sessions = config.max_concurrent_sessions.max(1);

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            session_slots: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    /// Check if a connection attempt from `ip` is allowed.
    pub fn check_connection(&self, ip: &IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Reserve a session slot. The slot is released when the permit drops.
    pub fn acquire_session(&self) -> Result<OwnedSemaphorePermit, RateLimitError> {
        self.session_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RateLimitError::SessionCapReached)
    }

    /// Session slots currently free.
    pub fn sessions_available(&self) -> usize {
        self.session_slots.available_permits()
    }

    /// Get the number of tracked peer addresses (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Evict addresses whose quota has fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
    }
}

/// Spawn a background task that sweeps idle limiter entries.
///
/// Without it the keyed limiter gains one entry per distinct peer address
/// and never loses any. Abort the returned handle to stop it.
pub fn spawn_limiter_cleanup(limits: RateLimits, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("Limiter cleanup started (interval: {:?})", every);
        let mut timer = tokio::time::interval(every);
        // First tick fires immediately.
        timer.tick().await;

        loop {
            timer.tick().await;
            let before = limits.connection_keys_count();
            limits.shrink();
            let evicted = before.saturating_sub(limits.connection_keys_count());
            if evicted > 0 {
                tracing::debug!("Limiter cleanup: evicted {} idle addresses", evicted);
            }
        }
    })
}

/// Admission error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    ConnectionLimitExceeded,
    /// Every session slot is taken.
    SessionCapReached,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::SessionCapReached => {
                write!(f, "concurrent session cap reached")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
