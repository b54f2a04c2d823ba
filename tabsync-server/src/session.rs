//! Per-connection session handling.
//!
//! Each accepted socket runs one [`Session`]: read the declaration within the
//! handshake timeout, check the token, resolve the table, then hand the
//! stream to the publisher role (`subscribe`) or the receiver role
//! (`publish`). Nothing a session does affects any other session.

use crate::error::{Result, ServerError};
use crate::server::TableServer;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tabsync_core::{
    run_publisher, run_receiver, CatchUp, FramedReader, FramedWriter, ProtocolError,
    ReplicationEngine, ReplicationError, RoleStats, SessionActivity, TableStore,
};
use tabsync_types::{Action, Declaration, StateReply};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

/// A per-connection session.
pub struct Session {
    server: Arc<TableServer>,
    peer: SocketAddr,
}

impl Session {
    /// Create a new session for a connection from `peer`.
    pub fn new(server: Arc<TableServer>, peer: SocketAddr) -> Self {
        Self { server, peer }
    }

    /// Run the session until the peer leaves or something fails.
    ///
    /// A peer going away is a normal end and returns `Ok`.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedReader::new(read_half);
        let writer = FramedWriter::new(write_half);

        let declaration = match self.handshake(&mut reader).await {
            Ok(declaration) => declaration,
            Err(e) => {
                self.record_failure(&e);
                tracing::warn!("Handshake from {} failed: {}", self.peer, e);
                return Err(e.into());
            }
        };

        let Some(table) = self.server.table(&declaration.table) else {
            self.server
                .metrics()
                .protocol_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Peer {} asked for unknown table {}",
                self.peer,
                declaration.table
            );
            let err = ProtocolError::UnknownTable(declaration.table.to_string());
            return Err(ReplicationError::from(err).into());
        };

        let guard = self.server.sessions().register(
            declaration.table.clone(),
            self.peer,
            declaration.action,
        );
        self.server
            .metrics()
            .sessions_total
            .fetch_add(1, Ordering::Relaxed);

        let span = tracing::info_span!(
            "session",
            id = %guard.id(),
            table = %declaration.table,
            peer = %self.peer,
        );
        let outcome = async {
            tracing::info!(
                "{} session started (peer count {}, mtime {})",
                declaration.action,
                declaration.count,
                declaration.mtime
            );
            let (outcome, stats) = match declaration.action {
                Action::Subscribe => {
                    self.serve_subscriber(writer, table, &declaration, guard.activity())
                        .await
                }
                Action::Publish => {
                    self.serve_publisher(reader, writer, table, guard.activity())
                        .await
                }
            };
            tracing::info!(
                "{} session ended: {} frames, {} rows, {} bytes, {} dropped",
                declaration.action,
                stats.frames,
                stats.rows,
                stats.bytes,
                stats.dropped_batches
            );
            outcome
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                tracing::debug!("Peer {} went away: {}", self.peer, e);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e);
                tracing::warn!(
                    "Session for {} with {} failed: {}",
                    declaration.table,
                    self.peer,
                    e
                );
                Err(ServerError::Replication(e))
            }
        }
    }

    async fn handshake<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FramedReader<R>,
    ) -> std::result::Result<Declaration, ReplicationError> {
        let auth = &self.server.config().auth;
        let timeout = auth.handshake_timeout();
        let declaration = tokio::time::timeout(timeout, reader.read_message::<Declaration>())
            .await
            .map_err(|_| ReplicationError::Timeout(timeout))??;

        declaration.validate()?;
        self.server
            .credentials()
            .validate(&declaration.token, auth.token_ttl())?;
        Ok(declaration)
    }

    /// Peer subscribed: this side publishes.
    async fn serve_subscriber<W: AsyncWrite + Unpin>(
        &self,
        mut writer: FramedWriter<W>,
        table: Arc<dyn TableStore>,
        declaration: &Declaration,
        activity: &SessionActivity,
    ) -> (std::result::Result<(), ReplicationError>, RoleStats) {
        let mut stats = RoleStats::default();
        let replication = &self.server.config().replication;
        let catch_up = CatchUp::from_params(
            declaration.count,
            declaration.mtime,
            &declaration.subscribe_params(),
        );

        let mut engine =
            match ReplicationEngine::new(table, &catch_up, replication.engine_limits()) {
                Ok(engine) => engine,
                Err(e) => return (Err(e.into()), stats),
            };
        let options = replication.publish_options(declaration.bandwidth);
        let err = run_publisher(&mut writer, &mut engine, &options, activity, &mut stats).await;
        self.server.metrics().record_sent(&stats);
        (Err(err), stats)
    }

    /// Peer publishes: reply with local state, then receive.
    async fn serve_publisher<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
        &self,
        mut reader: FramedReader<R>,
        mut writer: FramedWriter<W>,
        table: Arc<dyn TableStore>,
        activity: &SessionActivity,
    ) -> (std::result::Result<(), ReplicationError>, RoleStats) {
        let mut stats = RoleStats::default();
        let reply = StateReply {
            mtime: table.mtime(),
            count: table.count(),
        };
        if let Err(e) = writer.write_message(&reply).await {
            return (Err(e), stats);
        }

        reader.set_read_timeout(Some(self.server.config().replication.read_timeout()));
        let outcome = run_receiver(&mut reader, table.as_ref(), activity, &mut stats).await;
        self.server.metrics().record_received(&stats);
        (outcome, stats)
    }

    fn record_failure(&self, err: &ReplicationError) {
        let metrics = self.server.metrics();
        match err {
            ReplicationError::Auth(_) => {
                metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            }
            ReplicationError::Protocol(_) | ReplicationError::Message(_) => {
                metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tabsync_core::{Credentials, Frame, MemoryTable, RecordBatch, TableLayout};
    use tabsync_types::{SubscribeParams, TableId};
    use tokio::io::AsyncWriteExt;

    fn credentials() -> Credentials {
        Credentials::new("session-test-secret", "session-test-phrase").unwrap()
    }

    fn table_id() -> TableId {
        TableId::new("db", "D1", "src", "rows")
    }

    fn rows(n: u64) -> RecordBatch {
        let rows: Vec<[u8; 16]> = (0..n)
            .map(|i| {
                let mut r = [0u8; 16];
                r[..8].copy_from_slice(&i.to_le_bytes());
                r
            })
            .collect();
        RecordBatch::pack(16, rows.iter().map(|r| r.as_slice())).unwrap()
    }

    fn server_with(rows_in_table: u64) -> (Arc<TableServer>, Arc<MemoryTable>) {
        let server = Arc::new(TableServer::new(Config::default(), credentials()));
        let table = Arc::new(MemoryTable::new(TableLayout::new(16)).unwrap());
        if rows_in_table > 0 {
            table.extend(&rows(rows_in_table)).unwrap();
        }
        server.host_table(table_id(), table.clone()).unwrap();
        (server, table)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn subscriber_receives_rows() {
        let (server, _table) = server_with(5);
        let (client, socket) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(Session::new(server.clone(), peer()).run(socket));

        let (client_read, client_write) = tokio::io::split(client);
        let mut writer = FramedWriter::new(client_write);
        let token = credentials().issue_token().unwrap();
        let decl = Declaration::subscribe(token, table_id(), 0, 0.0, &SubscribeParams::default());
        writer.write_message(&decl).await.unwrap();

        let mut reader = FramedReader::new(client_read);
        let Frame::Data(payload) = reader.read_frame().await.unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(payload, rows(5).into_bytes());
        assert_eq!(server.sessions().len(), 1);

        drop(reader);
        drop(writer);
        task.abort();
    }

    #[tokio::test]
    async fn bad_token_closes_without_frames() {
        let (server, _table) = server_with(5);
        let (mut client, socket) = tokio::io::duplex(64 * 1024);

        let other = Credentials::new("wrong-secret", "session-test-phrase").unwrap();
        let decl = Declaration::subscribe(
            other.issue_token().unwrap(),
            table_id(),
            0,
            0.0,
            &SubscribeParams::default(),
        );
        client.write_all(&decl.to_bytes().unwrap()).await.unwrap();

        let result = Session::new(server.clone(), peer()).run(socket).await;
        assert!(matches!(
            result,
            Err(ServerError::Replication(ReplicationError::Auth(_)))
        ));
        assert_eq!(server.metrics().auth_failures.load(Ordering::Relaxed), 1);
        assert!(server.sessions().is_empty());

        let mut reader = FramedReader::new(client);
        assert!(matches!(
            reader.read_frame().await,
            Err(ReplicationError::Closed)
        ));
    }

    #[tokio::test]
    async fn unknown_table_is_a_protocol_error() {
        let (server, _table) = server_with(0);
        let (mut client, socket) = tokio::io::duplex(64 * 1024);
        let decl = Declaration::subscribe(
            credentials().issue_token().unwrap(),
            TableId::new("db", "D1", "src", "missing"),
            0,
            0.0,
            &SubscribeParams::default(),
        );
        client.write_all(&decl.to_bytes().unwrap()).await.unwrap();

        let result = Session::new(server.clone(), peer()).run(socket).await;
        assert!(matches!(
            result,
            Err(ServerError::Replication(ReplicationError::Protocol(
                ProtocolError::UnknownTable(_)
            )))
        ));
        assert_eq!(server.metrics().protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_in_handshake() {
        let (server, _table) = server_with(0);
        let (_client, socket) = tokio::io::duplex(1024);
        let result = Session::new(server, peer()).run(socket).await;
        assert!(matches!(
            result,
            Err(ServerError::Replication(ReplicationError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn publisher_gets_state_reply_and_rows_are_applied() {
        let (server, table) = server_with(3);
        let (client, socket) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(Session::new(server.clone(), peer()).run(socket));

        let (client_read, client_write) = tokio::io::split(client);
        let mut writer = FramedWriter::new(client_write);
        let mut reader = FramedReader::new(client_read);
        let decl = Declaration::publish(
            credentials().issue_token().unwrap(),
            table_id(),
            10,
            0.0,
            1_000_000,
        );
        writer.write_message(&decl).await.unwrap();

        let reply: StateReply = reader.read_message().await.unwrap();
        assert_eq!(reply.count, 3);

        let extra = rows(5).into_bytes();
        writer.write_frame(&extra[3 * 16..]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        drop(reader);

        task.await.unwrap().unwrap();
        assert_eq!(table.count(), 5);
        assert_eq!(server.metrics().rows_received.load(Ordering::Relaxed), 2);
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn wrong_container_is_rejected() {
        let (server, _table) = server_with(0);
        let (mut client, socket) = tokio::io::duplex(64 * 1024);
        let mut decl = Declaration::subscribe(
            credentials().issue_token().unwrap(),
            table_id(),
            0,
            0.0,
            &SubscribeParams::default(),
        );
        decl.container = "tree".into();
        client.write_all(&decl.to_bytes().unwrap()).await.unwrap();

        let result = Session::new(server, peer()).run(socket).await;
        assert!(matches!(
            result,
            Err(ServerError::Replication(ReplicationError::Message(_)))
        ));
    }
}
