//! Error types for tabsync-server.

use tabsync_core::{AuthError, ReplicationError, TableError};
use tabsync_types::TableId;

use crate::limits::RateLimitError;

/// Main error type for tabsync-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Listener could not bind. Fatal to the process.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Credentials could not be loaded.
    #[error("credentials error: {0}")]
    Credentials(#[from] AuthError),

    /// A session failed.
    #[error("session error: {0}")]
    Replication(#[from] ReplicationError),

    /// A table could not be created or hosted.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// A table with the same id is already hosted.
    #[error("table already hosted: {0}")]
    DuplicateTable(TableId),

    /// Connection refused by an admission limit.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] RateLimitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ServerError::DuplicateTable(TableId::new("db", "D1", "src", "t"));
        assert_eq!(err.to_string(), "table already hosted: db/D1/src/t");

        let err = ServerError::from(RateLimitError::SessionCapReached);
        assert_eq!(
            err.to_string(),
            "rate limit exceeded: concurrent session cap reached"
        );
    }

    #[test]
    fn session_errors_wrap_replication_errors() {
        let err = ServerError::from(ReplicationError::Closed);
        assert!(matches!(err, ServerError::Replication(ReplicationError::Closed)));
    }
}
