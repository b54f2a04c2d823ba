//! # tabsync-core
//!
//! Protocol machinery shared by the tabsync server and client.
//!
//! ## Layers
//!
//! - [`codec`] - fixed-width record batches
//! - [`frame`] - lz4 frames, heartbeats and incremental decoding
//! - [`auth`] - freshness-bound encrypted tokens
//! - [`table`] - the [`TableStore`] boundary and [`MemoryTable`]
//! - [`replication`] - catch-up windows and incremental diffs per peer
//! - [`throttle`] - bandwidth pacing, heartbeats and liveness stamps
//! - [`wire`] - framed async reads and writes
//! - [`roles`] - the publisher and receiver loops
//!
//! Everything above [`wire`] is synchronous and tested without a runtime.
//! The role loops are generic over `AsyncRead`/`AsyncWrite`, so the server,
//! the client and the tests all drive the same code.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod codec;
pub mod error;
pub mod frame;
pub mod replication;
pub mod roles;
pub mod table;
pub mod throttle;
pub mod wire;

pub use auth::{AuthError, Credentials, DEFAULT_TOKEN_TTL};
pub use codec::RecordBatch;
pub use error::{ProtocolError, ReplicationError, Result, TableError, TableResult};
pub use frame::{encode_frame, Frame, FrameDecoder, HEARTBEAT};
pub use replication::{Batch, CatchUp, EngineLimits, PeerCursor, ReplicationEngine};
pub use roles::{run_publisher, run_receiver, PublishOptions, RoleStats};
pub use table::{MemoryTable, TableLayout, TableStore};
pub use throttle::{HeartbeatTimer, SessionActivity, Throttle};
pub use wire::{FramedReader, FramedWriter};
