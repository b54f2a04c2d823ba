//! Error types for tabsync messages.

use thiserror::Error;

/// Errors that can occur while encoding or decoding handshake messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Message exceeds the text message ceiling
    #[error("message too large: {size} bytes (limit: {limit} bytes)")]
    TooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Declaration names a container other than `table`
    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),

    /// A required field is empty
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MessageError::UnsupportedContainer("timeseries".into());
        assert_eq!(err.to_string(), "unsupported container: timeseries");

        let err = MessageError::TooLarge {
            size: 70_000,
            limit: 65_536,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 70000 bytes (limit: 65536 bytes)"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MessageError>();
    }
}
