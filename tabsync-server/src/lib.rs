//! # tabsync-server
//!
//! Hosting side of the tabsync table replication protocol.
//!
//! A server hosts any number of tables behind the
//! [`TableStore`](tabsync_core::TableStore) boundary and accepts TCP
//! sessions for them:
//! - `subscribe` peers get a catch-up window and then a live diff
//! - `publish` peers get the local row count and stream rows in
//!
//! ## Architecture
//!
//! ```text
//! subscriber ──┐                         ┌── publisher
//!              │  declaration + frames   │
//!              ▼                         ▼
//!        ┌──────────────────────────────────────┐
//!        │ Listener ─► Session (one task each)  │
//!        │                │                     │
//!        │        TableServer { tables }        │
//!        └──────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod limits;
pub mod listener;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError};
pub use error::ServerError;
pub use limits::{spawn_limiter_cleanup, RateLimitError, RateLimits};
pub use listener::Listener;
pub use server::{ServerMetrics, SessionGuard, SessionInfo, SessionRegistry, TableServer};
pub use session::Session;
