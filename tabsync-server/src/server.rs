//! Main TableServer coordination.
//!
//! TableServer owns the hosted tables, the live-session registry, admission
//! limits and operational metrics. Sessions only ever share the table stores.

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::limits::RateLimits;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tabsync_core::{Credentials, MemoryTable, RoleStats, SessionActivity, TableStore};
use tabsync_types::{Action, SessionId, TableId};

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Total connections accepted (before admission checks).
    pub connections_total: AtomicU64,
    /// Total sessions that completed the handshake.
    pub sessions_total: AtomicU64,
    /// Total handshakes rejected for a bad token.
    pub auth_failures: AtomicU64,
    /// Total sessions ended by a protocol violation.
    pub protocol_errors: AtomicU64,
    /// Total connections refused by an admission limit.
    pub rate_limit_hits: AtomicU64,
    /// Data frames sent to subscribers.
    pub frames_sent: AtomicU64,
    /// Rows sent to subscribers.
    pub rows_sent: AtomicU64,
    /// Bytes sent to subscribers.
    pub bytes_sent: AtomicU64,
    /// Data frames received from publishers.
    pub frames_received: AtomicU64,
    /// Rows received from publishers.
    pub rows_received: AtomicU64,
    /// Payload bytes received from publishers.
    pub bytes_received: AtomicU64,
    /// Batches dropped by either role.
    pub dropped_batches: AtomicU64,
}

impl ServerMetrics {
    /// Add the counters of a finished publisher run.
    pub fn record_sent(&self, stats: &RoleStats) {
        self.frames_sent.fetch_add(stats.frames, Ordering::Relaxed);
        self.rows_sent.fetch_add(stats.rows, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes, Ordering::Relaxed);
        self.dropped_batches
            .fetch_add(stats.dropped_batches, Ordering::Relaxed);
    }

    /// Add the counters of a finished receiver run.
    pub fn record_received(&self, stats: &RoleStats) {
        self.frames_received.fetch_add(stats.frames, Ordering::Relaxed);
        self.rows_received.fetch_add(stats.rows, Ordering::Relaxed);
        self.bytes_received.fetch_add(stats.bytes, Ordering::Relaxed);
        self.dropped_batches
            .fetch_add(stats.dropped_batches, Ordering::Relaxed);
    }
}

/// A live session as seen by monitors.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Process-local id.
    pub id: SessionId,
    /// Table being replicated.
    pub table: TableId,
    /// Remote address.
    pub peer: SocketAddr,
    /// What the peer declared.
    pub action: Action,
    /// When the handshake completed.
    pub started_at: SystemTime,
    /// Last-activity stamp, touched on every frame.
    pub activity: Arc<SessionActivity>,
}

/// Registry of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session. It stays registered until the guard drops.
    pub fn register(&self, table: TableId, peer: SocketAddr, action: Action) -> SessionGuard {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let activity = Arc::new(SessionActivity::new());
        self.sessions.insert(
            id,
            SessionInfo {
                id,
                table,
                peer,
                action,
                started_at: SystemTime::now(),
                activity: activity.clone(),
            },
        );

        tracing::debug!("Registered session {} (total: {})", id, self.sessions.len());
        SessionGuard {
            id,
            activity,
            sessions: self.sessions.clone(),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of every live session.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Live sessions replicating `table`.
    pub fn for_table(&self, table: &TableId) -> Vec<SessionInfo> {
        self.snapshot()
            .into_iter()
            .filter(|s| &s.table == table)
            .collect()
    }
}

/// Keeps a session registered; unregisters on drop.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    activity: Arc<SessionActivity>,
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
}

impl SessionGuard {
    /// The session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's activity stamp.
    pub fn activity(&self) -> &SessionActivity {
        &self.activity
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        tracing::debug!(
            "Unregistered session {} (remaining: {})",
            self.id,
            self.sessions.len()
        );
    }
}

/// Main hosting server.
pub struct TableServer {
    config: Config,
    credentials: Credentials,
    /// Tables that peers may subscribe to or publish into.
    tables: DashMap<TableId, Arc<dyn TableStore>>,
    /// Live sessions.
    sessions: SessionRegistry,
    /// Per-IP and concurrency limits.
    rate_limits: RateLimits,
    /// Operational metrics (counters).
    metrics: ServerMetrics,
}

impl std::fmt::Debug for TableServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableServer")
            .field("config", &self.config)
            .field("tables_count", &self.tables.len())
            .field("sessions_count", &self.sessions.len())
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl TableServer {
    /// Create a server with no tables.
    pub fn new(config: Config, credentials: Credentials) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            credentials,
            tables: DashMap::new(),
            sessions: SessionRegistry::new(),
            rate_limits,
            metrics: ServerMetrics::default(),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Credentials used to validate tokens.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Make a table available to peers.
    pub fn host_table(&self, id: TableId, table: Arc<dyn TableStore>) -> Result<()> {
        match self.tables.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(ServerError::DuplicateTable(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                tracing::info!(
                    "Hosting table {} (row size {}, {})",
                    e.key(),
                    table.row_size(),
                    if table.has_index() { "indexed" } else { "append-only" }
                );
                e.insert(table);
                Ok(())
            }
        }
    }

    /// Host an empty [`MemoryTable`] for every `[[tables]]` entry in the
    /// configuration. Returns how many were added.
    pub fn host_configured_tables(&self) -> Result<usize> {
        for entry in &self.config.tables {
            let table = MemoryTable::new(entry.layout())?;
            self.host_table(entry.id(), Arc::new(table))?;
        }
        Ok(self.config.tables.len())
    }

    /// Look up a hosted table.
    pub fn table(&self, id: &TableId) -> Option<Arc<dyn TableStore>> {
        self.tables.get(id).map(|t| t.value().clone())
    }

    /// Ids of every hosted table.
    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self.tables.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Get access to the admission limits.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use tabsync_core::TableLayout;

    fn credentials() -> Credentials {
        Credentials::new("server-test-secret", "server-test-phrase").unwrap()
    }

    fn table_id(name: &str) -> TableId {
        TableId::new("db", "D1", "src", name)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn host_and_lookup_tables() {
        let server = TableServer::new(Config::default(), credentials());
        let table = Arc::new(MemoryTable::new(TableLayout::new(16)).unwrap());
        server.host_table(table_id("a"), table).unwrap();

        assert!(server.table(&table_id("a")).is_some());
        assert!(server.table(&table_id("b")).is_none());
        assert_eq!(server.table_ids(), vec![table_id("a")]);
    }

    #[test]
    fn duplicate_table_is_rejected() {
        let server = TableServer::new(Config::default(), credentials());
        let make = || Arc::new(MemoryTable::new(TableLayout::new(16)).unwrap());
        server.host_table(table_id("a"), make()).unwrap();
        assert!(matches!(
            server.host_table(table_id("a"), make()),
            Err(ServerError::DuplicateTable(_))
        ));
    }

    #[test]
    fn configured_tables_are_hosted() {
        let mut config = Config::default();
        config.tables.push(TableConfig {
            database: "db".into(),
            period: "D1".into(),
            source: "src".into(),
            tablename: "quotes".into(),
            row_size: 32,
            key_offset: Some(0),
            key_len: 8,
            mtime_offset: Some(8),
            date_offset: None,
        });
        let server = TableServer::new(config, credentials());
        assert_eq!(server.host_configured_tables().unwrap(), 1);

        let table = server.table(&table_id("quotes")).unwrap();
        assert!(table.has_index());
        assert_eq!(table.row_size(), 32);
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = SessionRegistry::new();
        let a = registry.register(table_id("a"), peer(), Action::Subscribe);
        let b = registry.register(table_id("b"), peer(), Action::Publish);
        assert_eq!(registry.len(), 2);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.for_table(&table_id("a")).len(), 1);

        drop(a);
        assert_eq!(registry.len(), 1);
        assert!(registry.for_table(&table_id("a")).is_empty());

        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_shares_activity_with_guard() {
        let registry = SessionRegistry::new();
        let guard = registry.register(table_id("a"), peer(), Action::Subscribe);
        guard.activity().touch();

        let info = &registry.snapshot()[0];
        assert_eq!(info.id, guard.id());
        assert_eq!(info.activity.last_millis(), guard.activity().last_millis());
        assert_eq!(info.action, Action::Subscribe);
    }

    #[test]
    fn metrics_accumulate_role_stats() {
        let metrics = ServerMetrics::default();
        let stats = RoleStats {
            frames: 2,
            rows: 20,
            bytes: 640,
            heartbeats: 1,
            dropped_batches: 1,
        };
        metrics.record_sent(&stats);
        metrics.record_received(&stats);

        assert_eq!(metrics.rows_sent.load(Ordering::Relaxed), 20);
        assert_eq!(metrics.frames_received.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.dropped_batches.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn debug_does_not_expose_credentials() {
        let server = TableServer::new(Config::default(), credentials());
        let debug = format!("{:?}", server);
        assert!(debug.contains("TableServer"));
        assert!(!debug.contains("server-test-phrase"));
    }
}
