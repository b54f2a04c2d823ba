//! Error types for tabsync-core.
//!
//! The variants of [`ReplicationError`] follow how a failure affects a
//! session: everything except [`TableError`] ends the session, while a table
//! error only drops the offending batch.

use std::time::Duration;
use tabsync_types::MessageError;
use thiserror::Error;

use crate::auth::AuthError;

/// Framing and decoding errors. Fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Length prefix exceeds the protocol ceiling.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Declared compressed size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Payload could not be decompressed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Stream ended in the middle of a frame or message.
    #[error("stream ended mid-message ({buffered} bytes buffered)")]
    Truncated {
        /// Bytes received before the stream ended.
        buffered: usize,
    },

    /// Peer sent something other than what the protocol expects here.
    #[error("unexpected message: {0}")]
    Unexpected(String),

    /// Declaration names a table this process does not host.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}

/// Table store errors. The batch is dropped; the session continues.
#[derive(Debug, Error)]
pub enum TableError {
    /// Row size of zero.
    #[error("invalid row size: {0}")]
    InvalidRowSize(usize),

    /// Payload is not a whole number of rows.
    #[error("ragged batch: {len} bytes is not a multiple of row size {row_size}")]
    RaggedBatch {
        /// Payload length.
        len: usize,
        /// Expected row width.
        row_size: usize,
    },

    /// Record width does not match the table layout.
    #[error("row size mismatch: expected {expected}, got {actual}")]
    RowSizeMismatch {
        /// Table row width.
        expected: usize,
        /// Width presented.
        actual: usize,
    },

    /// Requested rows lie outside the table.
    #[error("row range {lo}..{hi} out of bounds (count: {count})")]
    OutOfBounds {
        /// First row requested.
        lo: u64,
        /// One past the last row requested.
        hi: u64,
        /// Current row count.
        count: u64,
    },

    /// Operation needs an indexed table.
    #[error("table has no index")]
    NotIndexed,

    /// Row count went backwards.
    #[error("row count went backwards: {previous} -> {current}")]
    CountRegressed {
        /// Count previously observed.
        previous: u64,
        /// Count observed now.
        current: u64,
    },

    /// Store refused the write.
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Everything that can end (or disturb) a replication session.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Framing or protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Table store error.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Handshake message error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Read did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ReplicationError {
    /// True for transport-level failures (socket, close, timeout).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed | Self::Timeout(_))
    }
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type alias for table store operations.
pub type TableResult<T> = std::result::Result<T, TableError>;
