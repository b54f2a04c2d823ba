//! ReplicationLink - one outbound replication relationship.
//!
//! A link connects to a hosting server, declares what it wants, and then
//! runs one of the two role loops from tabsync-core:
//!
//! ```text
//! subscribe:  declaration ──►            frames ◄── server publishes
//! publish:    declaration ──►  ◄── state reply  ──► frames
//! ```
//!
//! [`ReplicationLink::run`] wraps single sessions in a reconnect loop, so a
//! link keeps replicating across server restarts and network failures.

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tabsync_core::replication::{EngineLimits, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_WINDOW_ROWS};
use tabsync_core::throttle::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL};
use tabsync_core::{
    run_publisher, run_receiver, CatchUp, Credentials, FramedReader, FramedWriter,
    PublishOptions, ReplicationEngine, ReplicationError, RoleStats, SessionActivity, TableStore,
};
use tabsync_types::{Action, Declaration, StateReply, SubscribeParams, TableId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Default wait between sessions.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for any byte from the server.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect failed.
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        /// Server address.
        endpoint: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Server address.
        endpoint: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The session failed after connecting.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),
}

/// Configuration for a [`ReplicationLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Server address (`host:port`).
    pub endpoint: String,
    /// Table to replicate.
    pub table: TableId,
    /// Whether this side receives or sends.
    pub action: Action,
    /// Lookback, snapshot and bandwidth carried in the declaration.
    pub params: SubscribeParams,
    /// Wait between sessions.
    pub retry_delay: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time to wait for any byte from the server.
    pub read_timeout: Duration,
    /// Sender sleep between rescans.
    pub poll_interval: Duration,
    /// Sender idle time before a heartbeat.
    pub heartbeat_interval: Duration,
    /// Sender engine limits.
    pub limits: EngineLimits,
}

impl LinkConfig {
    fn new(endpoint: &str, table: TableId, action: Action) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            table,
            action,
            params: SubscribeParams::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            limits: EngineLimits {
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
                max_window_rows: DEFAULT_MAX_WINDOW_ROWS,
            },
        }
    }

    /// Receive `table` from the server at `endpoint`.
    pub fn subscribe(endpoint: &str, table: TableId) -> Self {
        Self::new(endpoint, table, Action::Subscribe)
    }

    /// Send local rows of `table` into the server at `endpoint`.
    pub fn publish(endpoint: &str, table: TableId) -> Self {
        Self::new(endpoint, table, Action::Publish)
    }

    /// Ask for the trailing `lines` rows.
    pub fn with_lookback_lines(mut self, lines: u64) -> Self {
        self.params.lookback_lines = lines;
        self
    }

    /// Start the window at the first row on or after `date`.
    pub fn with_lookback_date(mut self, date: NaiveDate) -> Self {
        self.params.lookback_date = Some(date);
        self
    }

    /// Resend the whole window once before switching to incremental mode.
    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.params.snapshot = snapshot;
        self
    }

    /// Set the bandwidth ceiling in bytes per second.
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.params.bandwidth = bandwidth;
        self
    }

    /// Set the wait between sessions.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for any byte from the server.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the sender's rescan interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the sender's heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the sender's maximum raw bytes per frame.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.limits.max_frame_bytes = bytes;
        self
    }

    fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            bandwidth: self.params.bandwidth,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// One outbound replication relationship for a local table.
pub struct ReplicationLink {
    config: LinkConfig,
    credentials: Credentials,
    table: Arc<dyn TableStore>,
    activity: Arc<SessionActivity>,
}

impl std::fmt::Debug for ReplicationLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationLink")
            .field("config", &self.config)
            .field("activity", &self.activity)
            .finish_non_exhaustive()
    }
}

impl ReplicationLink {
    /// Create a link for `table`.
    pub fn new(config: LinkConfig, credentials: Credentials, table: Arc<dyn TableStore>) -> Self {
        Self {
            config,
            credentials,
            table,
            activity: Arc::new(SessionActivity::new()),
        }
    }

    /// The link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Last-activity stamp, touched on every frame sent or received.
    pub fn activity(&self) -> Arc<SessionActivity> {
        self.activity.clone()
    }

    /// Run a single session to completion.
    ///
    /// A subscriber session ends cleanly when the server closes the socket;
    /// a sender session only ends with an error.
    pub async fn run_once(&self) -> Result<RoleStats, ClientError> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedReader::new(read_half).with_read_timeout(self.config.read_timeout);
        let mut writer = FramedWriter::new(write_half);

        let token = self
            .credentials
            .issue_token()
            .map_err(ReplicationError::from)?;
        let count = self.table.count();
        let mtime = self.table.mtime();
        let declaration = match self.config.action {
            Action::Subscribe => Declaration::subscribe(
                token,
                self.config.table.clone(),
                count,
                mtime,
                &self.config.params,
            ),
            Action::Publish => Declaration::publish(
                token,
                self.config.table.clone(),
                count,
                mtime,
                self.config.params.bandwidth,
            ),
        };
        writer.write_message(&declaration).await?;
        self.activity.touch();
        tracing::info!("Declared {} with count {}", self.config.action, count);

        let mut stats = RoleStats::default();
        match self.config.action {
            Action::Subscribe => {
                run_receiver(&mut reader, self.table.as_ref(), &self.activity, &mut stats)
                    .await?;
                Ok(stats)
            }
            Action::Publish => {
                let reply: StateReply = reader.read_message().await?;
                tracing::debug!("Server holds {} rows (mtime {})", reply.count, reply.mtime);
                // Every row past the server's count is due; lookback only sizes
                // the window watched for in-place updates.
                let catch_up = CatchUp::send_missing(reply.count, reply.mtime)
                    .with_lookback_lines(self.config.params.lookback_lines);
                let mut engine = ReplicationEngine::new(
                    self.table.clone(),
                    &catch_up,
                    self.config.limits,
                )
                .map_err(ReplicationError::from)?;
                let options = self.config.publish_options();
                let err =
                    run_publisher(&mut writer, &mut engine, &options, &self.activity, &mut stats)
                        .await;
                tracing::debug!("Sender stopped after {} rows", stats.rows);
                Err(err.into())
            }
        }
    }

    /// Run sessions forever, reconnecting after `retry_delay`.
    ///
    /// Never returns; cancel by aborting the task.
    pub async fn run(&self) {
        let span = tracing::info_span!(
            "link",
            table = %self.config.table,
            endpoint = %self.config.endpoint,
            action = %self.config.action,
        );
        async {
            loop {
                match self.run_once().await {
                    Ok(stats) => tracing::info!(
                        "Session ended: {} frames, {} rows",
                        stats.frames,
                        stats.rows
                    ),
                    Err(e) => tracing::warn!("Session failed: {}", e),
                }
                tracing::debug!("Reconnecting in {:?}", self.config.retry_delay);
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        .instrument(span)
        .await
    }

    /// Run the reconnect loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let endpoint = &self.config.endpoint;
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                endpoint: endpoint.clone(),
                timeout,
            })?
            .map_err(|source| ClientError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }
}
