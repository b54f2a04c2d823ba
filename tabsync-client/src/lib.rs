//! # tabsync-client
//!
//! Outbound side of the tabsync table replication protocol.
//!
//! A [`ReplicationLink`] binds one local table to one remote table and keeps
//! it replicated:
//! - **subscribe**: the server streams its rows into the local table
//! - **publish**: local rows stream into the server's table
//!
//! ## Example
//!
//! ```ignore
//! use tabsync_client::{LinkConfig, ReplicationLink};
//! use tabsync_core::Credentials;
//! use tabsync_types::TableId;
//!
//! let table_id = TableId::new("MarketData", "D1", "YFinance", "AAPL");
//! let config = LinkConfig::subscribe("10.0.0.5:7070", table_id).with_lookback_lines(5000);
//! let link = ReplicationLink::new(config, Credentials::from_env()?, local_table);
//! let handle = link.spawn();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod link;

pub use link::{
    ClientError, LinkConfig, ReplicationLink, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
    DEFAULT_RETRY_DELAY,
};
