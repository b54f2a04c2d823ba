//! Publisher and receiver loops that run once a handshake is complete.
//!
//! Both loops are transport-agnostic: the server runs them on accepted
//! sockets, the client on outbound ones, and tests on in-memory duplex
//! streams.

use std::time::Duration;
use tabsync_types::DEFAULT_BANDWIDTH;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::codec::RecordBatch;
use crate::error::{ReplicationError, Result};
use crate::frame::Frame;
use crate::replication::ReplicationEngine;
use crate::table::TableStore;
use crate::throttle::{
    HeartbeatTimer, SessionActivity, Throttle, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL,
};
use crate::wire::{FramedReader, FramedWriter};

/// Tuning for [`run_publisher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    /// Ceiling in bytes per second.
    pub bandwidth: u64,
    /// Sleep between rescans when the peer is up to date.
    pub poll_interval: Duration,
    /// Idle time before a heartbeat is sent.
    pub heartbeat_interval: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            bandwidth: DEFAULT_BANDWIDTH,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Counters for one run of a role loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleStats {
    /// Data frames sent or received.
    pub frames: u64,
    /// Rows carried by those frames.
    pub rows: u64,
    /// Bytes on the wire, including length prefixes.
    pub bytes: u64,
    /// Heartbeats sent or received.
    pub heartbeats: u64,
    /// Batches dropped because of a table error.
    pub dropped_batches: u64,
}

/// Stream due rows to the peer until the connection fails.
///
/// Only returns on a fatal error; table errors drop the batch and the loop
/// carries on. `stats` stays readable by the caller afterwards.
pub async fn run_publisher<W: AsyncWrite + Unpin>(
    writer: &mut FramedWriter<W>,
    engine: &mut ReplicationEngine,
    options: &PublishOptions,
    activity: &SessionActivity,
    stats: &mut RoleStats,
) -> ReplicationError {
    let throttle = Throttle::new(options.bandwidth);
    let mut heartbeat = HeartbeatTimer::new(options.heartbeat_interval);

    loop {
        if let Err(e) =
            publish_due(writer, engine, &throttle, &mut heartbeat, activity, stats).await
        {
            return e;
        }

        if heartbeat.is_due(Instant::now()) {
            if let Err(e) = writer.write_heartbeat().await {
                return e;
            }
            stats.heartbeats += 1;
            heartbeat.reset(Instant::now());
            activity.touch();
        }

        tokio::time::sleep(options.poll_interval).await;
    }
}

async fn publish_due<W: AsyncWrite + Unpin>(
    writer: &mut FramedWriter<W>,
    engine: &mut ReplicationEngine,
    throttle: &Throttle,
    heartbeat: &mut HeartbeatTimer,
    activity: &SessionActivity,
    stats: &mut RoleStats,
) -> Result<()> {
    loop {
        let batch = match engine.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("Dropping batch: {}", e);
                stats.dropped_batches += 1;
                return Ok(());
            }
        };

        let started = Instant::now();
        let sent = writer.write_frame(&batch.payload).await?;
        stats.frames += 1;
        stats.rows += batch.rows.len() as u64;
        stats.bytes += sent as u64;
        heartbeat.reset(Instant::now());
        activity.touch();
        tracing::debug!(
            "Sent {} rows ({} raw bytes, {} on wire)",
            batch.rows.len(),
            batch.payload.len(),
            sent
        );

        throttle.pace(started, sent).await;
    }
}

/// Apply incoming frames to `table` until the peer closes.
///
/// Indexed tables take batches through `upsert`, append-only tables through
/// `extend`. A clean close is `Ok`; any other read failure is returned.
pub async fn run_receiver<R: AsyncRead + Unpin>(
    reader: &mut FramedReader<R>,
    table: &dyn TableStore,
    activity: &SessionActivity,
    stats: &mut RoleStats,
) -> Result<()> {
    let row_size = table.row_size();
    let indexed = table.has_index();

    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(ReplicationError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        activity.touch();

        let payload = match frame {
            Frame::Heartbeat => {
                stats.heartbeats += 1;
                continue;
            }
            Frame::Data(payload) => payload,
        };
        stats.frames += 1;
        stats.bytes += payload.len() as u64;

        let applied = RecordBatch::from_bytes(row_size, payload).and_then(|batch| {
            let rows = batch.len();
            if indexed {
                table.upsert(&batch)?;
            } else {
                table.extend(&batch)?;
            }
            Ok(rows)
        });

        match applied {
            Ok(rows) => {
                stats.rows += rows as u64;
                tracing::debug!("Applied {} rows", rows);
            }
            Err(e) => {
                stats.dropped_batches += 1;
                tracing::warn!("Dropping batch: {}", e);
            }
        }
    }
}
