//! Configuration loading for tabsync-server.
//!
//! Configuration is loaded from a TOML file (default: `tabsync.toml`). Every
//! section and every field has a default, so an empty file is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tabsync_core::replication::{EngineLimits, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_WINDOW_ROWS};
use tabsync_core::{PublishOptions, TableLayout};
use tabsync_types::TableId;

/// Root configuration for tabsync-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Handshake configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Replication tuning.
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Admission limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// In-memory tables hosted by the standalone binary.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP bind address (default: 0.0.0.0:7070).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Handshake configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Seconds allowed for the declaration to arrive (default: 5).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Maximum token age in seconds (default: 5).
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// Replication tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Publisher sleep between rescans in milliseconds (default: 1).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Idle seconds before a heartbeat (default: 15).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Seconds a receiver waits for any byte before giving up (default: 60).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Raw bytes per frame before compression (default: 1MB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Cap on the lookback window in rows (default: 1,000,000).
    #[serde(default = "default_max_window_rows")]
    pub max_window_rows: u64,
}

/// Admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Connection attempts allowed per IP address per minute (default: 60).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Sessions allowed at once across all peers (default: 1024).
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Seconds between sweeps of idle per-IP limiter entries (default: 60).
    #[serde(default = "default_limiter_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

/// One in-memory table to host.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Database name.
    pub database: String,
    /// Period partition.
    pub period: String,
    /// Data source.
    pub source: String,
    /// Table name.
    pub tablename: String,
    /// Record width in bytes.
    pub row_size: usize,
    /// Offset of the key bytes; makes the table indexed.
    pub key_offset: Option<usize>,
    /// Length of the key bytes (default: 8).
    #[serde(default = "default_key_len")]
    pub key_len: usize,
    /// Offset of a little-endian `f64` row modification time.
    pub mtime_offset: Option<usize>,
    /// Offset of a little-endian `i64` row date in Unix seconds.
    pub date_offset: Option<usize>,
}

impl TableConfig {
    /// Routing key of the table.
    pub fn id(&self) -> TableId {
        TableId::new(&self.database, &self.period, &self.source, &self.tablename)
    }

    /// Record layout of the table.
    pub fn layout(&self) -> TableLayout {
        let mut layout = TableLayout::new(self.row_size);
        if let Some(offset) = self.key_offset {
            layout = layout.with_key(offset, self.key_len);
        }
        if let Some(offset) = self.mtime_offset {
            layout = layout.with_mtime(offset);
        }
        if let Some(offset) = self.date_offset {
            layout = layout.with_date(offset);
        }
        layout
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_token_ttl_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_max_window_rows() -> u64 {
    DEFAULT_MAX_WINDOW_ROWS
}

fn default_connections_per_minute() -> u32 {
    60
}

fn default_max_concurrent_sessions() -> usize {
    1024
}

fn default_limiter_cleanup_secs() -> u64 {
    60
}

fn default_key_len() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            max_window_rows: default_max_window_rows(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            cleanup_interval_secs: default_limiter_cleanup_secs(),
        }
    }
}

impl AuthConfig {
    /// Time allowed for the declaration to arrive.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Maximum token age.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl LimitsConfig {
    /// Time between limiter sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ReplicationConfig {
    /// Limits for a per-peer replication engine.
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_frame_bytes: self.max_frame_bytes,
            max_window_rows: self.max_window_rows,
        }
    }

    /// Publisher options at the bandwidth a peer negotiated.
    pub fn publish_options(&self, bandwidth: u64) -> PublishOptions {
        PublishOptions {
            bandwidth,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }

    /// Receiver read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("limits.connections_per_minute", self.limits.connections_per_minute as u64),
            ("limits.max_concurrent_sessions", self.limits.max_concurrent_sessions as u64),
            ("limits.cleanup_interval_secs", self.limits.cleanup_interval_secs),
            ("replication.heartbeat_secs", self.replication.heartbeat_secs),
            ("replication.read_timeout_secs", self.replication.read_timeout_secs),
            ("replication.max_frame_bytes", self.replication.max_frame_bytes as u64),
            ("replication.max_window_rows", self.replication.max_window_rows),
            ("auth.handshake_timeout_secs", self.auth.handshake_timeout_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }

        for table in &self.tables {
            if let Some(field) = table.id().missing_component() {
                return Err(ConfigError::Invalid(format!("table {field} must not be empty")));
            }
            table
                .layout()
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("table {}: {}", table.id(), e)))?;
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:7070");
        assert_eq!(config.auth.token_ttl(), Duration::from_secs(5));
        assert_eq!(config.replication.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.replication.max_frame_bytes, 1024 * 1024);
        assert!(config.tables.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.connections_per_minute, 60);
        assert_eq!(config.replication.heartbeat_secs, 15);
        assert_eq!(config.replication.poll_interval_ms, 1);
        assert_eq!(config.limits.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:9000"

[auth]
token_ttl_secs = 10

[replication]
heartbeat_secs = 5
max_window_rows = 5000

[limits]
max_concurrent_sessions = 8

[[tables]]
database = "MarketData"
period = "D1"
source = "YFinance"
tablename = "AAPL"
row_size = 32
key_offset = 0
mtime_offset = 8
date_offset = 16
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.auth.token_ttl_secs, 10);
        assert_eq!(config.auth.handshake_timeout_secs, 5);
        assert_eq!(config.replication.engine_limits().max_window_rows, 5000);
        assert_eq!(config.limits.max_concurrent_sessions, 8);

        let table = &config.tables[0];
        assert_eq!(table.id().to_string(), "MarketData/D1/YFinance/AAPL");
        let layout = table.layout();
        assert_eq!(layout.key, Some(0..8));
        assert_eq!(layout.mtime_offset, Some(8));
        config.validate().unwrap();
    }

    #[test]
    fn publish_options_carry_negotiated_bandwidth() {
        let options = ReplicationConfig::default().publish_options(42);
        assert_eq!(options.bandwidth, 42);
        assert_eq!(options.poll_interval, Duration::from_millis(1));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = Config::default();
        config.limits.connections_per_minute = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_table_layout_is_rejected() {
        let toml = r#"
[[tables]]
database = "db"
period = "D1"
source = "src"
tablename = "t"
row_size = 8
mtime_offset = 4
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"127.0.0.1:7171\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:7171");

        let missing = Config::from_file(std::path::Path::new("/nonexistent/tabsync.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nbind_address = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
