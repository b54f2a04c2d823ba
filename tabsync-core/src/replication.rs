//! Catch-up and incremental diff for one peer.
//!
//! The engine decides which rows of a [`TableStore`] a peer still needs:
//!
//! 1. At construction it resolves the lookback window (by date or by line
//!    count) and queues the initial catch-up range.
//! 2. Each rescan queues rows appended since the last rescan and, for
//!    indexed tables, rows inside the window whose modification time moved
//!    past the watermark recorded when they were last sent.
//! 3. [`ReplicationEngine::next_batch`] hands out due rows in ascending
//!    order, at most `floor(max_frame_bytes / row_size)` per batch.
//!
//! Watermarks exist only for rows inside the window, so memory is bounded by
//! the window length rather than the table size.

use chrono::NaiveDate;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tabsync_types::{SubscribeParams, DEFAULT_LOOKBACK_LINES};

use crate::error::{TableError, TableResult};
use crate::table::TableStore;

/// Default cap on frame payload size before compression (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default cap on the lookback window (rows).
pub const DEFAULT_MAX_WINDOW_ROWS: u64 = 1_000_000;

/// What the peer already has and how far back it wants to look.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUp {
    /// Peer's row count.
    pub peer_count: u64,
    /// Peer's latest modification time.
    pub peer_mtime: f64,
    /// Trailing rows to consider when no date is given.
    pub lookback_lines: u64,
    /// Window start date.
    pub lookback_date: Option<NaiveDate>,
    /// Resend the whole window first.
    pub snapshot: bool,
    /// Send every row from `peer_count` on, however far back that is.
    pub send_all_missing: bool,
}

impl CatchUp {
    /// Catch-up for a subscriber declaration.
    pub fn from_params(peer_count: u64, peer_mtime: f64, params: &SubscribeParams) -> Self {
        Self {
            peer_count,
            peer_mtime,
            lookback_lines: params.lookback_lines,
            lookback_date: params.lookback_date,
            snapshot: params.snapshot,
            send_all_missing: false,
        }
    }

    /// Plain resume from the peer's reported state.
    pub fn resume(peer_count: u64, peer_mtime: f64) -> Self {
        Self {
            peer_count,
            peer_mtime,
            lookback_lines: DEFAULT_LOOKBACK_LINES,
            lookback_date: None,
            snapshot: false,
            send_all_missing: false,
        }
    }

    /// Catch-up for a sender answering a `StateReply`.
    ///
    /// The receiver appends by count, so every row in `[peer_count, count)`
    /// is due no matter how many there are. The lookback only sizes the
    /// window tracked for in-place updates.
    pub fn send_missing(peer_count: u64, peer_mtime: f64) -> Self {
        Self {
            send_all_missing: true,
            ..Self::resume(peer_count, peer_mtime)
        }
    }

    /// Override the lookback line count.
    pub fn with_lookback_lines(mut self, lines: u64) -> Self {
        self.lookback_lines = lines;
        self
    }
}

/// Size limits applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum raw bytes per batch.
    pub max_frame_bytes: usize,
    /// Maximum rows tracked in the lookback window.
    pub max_window_rows: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_window_rows: DEFAULT_MAX_WINDOW_ROWS,
        }
    }
}

/// Rows ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Row indices, ascending.
    pub rows: Vec<u64>,
    /// Packed record bytes in the same order.
    pub payload: Vec<u8>,
}

/// How much of the table a peer has been sent.
#[derive(Debug, Clone)]
pub struct PeerCursor {
    /// Every row below this index has been queued.
    next_row: u64,
    /// First row of the lookback window.
    window_start: u64,
    /// Maximum window length.
    window_len: u64,
    /// Last-sent mtime for rows `[window_start, next_row)` (indexed only).
    watermarks: VecDeque<f64>,
    /// Rows due but not yet handed out.
    pending: VecDeque<u64>,
}

impl PeerCursor {
    /// Every row below this index has been queued.
    pub fn next_row(&self) -> u64 {
        self.next_row
    }

    /// First row of the lookback window.
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Maximum window length.
    pub fn window_len(&self) -> u64 {
        self.window_len
    }

    /// Rows queued and not yet sent.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Rows currently carrying a watermark.
    pub fn tracked(&self) -> usize {
        self.watermarks.len()
    }
}

/// Computes due rows for one peer of one table.
pub struct ReplicationEngine {
    table: Arc<dyn TableStore>,
    cursor: PeerCursor,
    indexed: bool,
    max_rows: usize,
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("cursor", &self.cursor)
            .field("indexed", &self.indexed)
            .field("max_rows", &self.max_rows)
            .finish_non_exhaustive()
    }
}

impl ReplicationEngine {
    /// Resolve the window and queue the initial catch-up.
    pub fn new(
        table: Arc<dyn TableStore>,
        catch_up: &CatchUp,
        limits: EngineLimits,
    ) -> TableResult<Self> {
        let row_size = table.row_size();
        if row_size == 0 {
            return Err(TableError::InvalidRowSize(0));
        }
        let indexed = table.has_index();
        let count = table.count();
        let max_window = limits.max_window_rows;

        let resume_point = catch_up.peer_count.min(count);

        let mut window_start = match catch_up.lookback_date {
            _ if catch_up.send_all_missing => {
                count.saturating_sub(catch_up.lookback_lines.max(count - resume_point))
            }
            Some(date) => table.row_for_date(date)?.min(count),
            None => count.saturating_sub(catch_up.lookback_lines),
        };
        if count - window_start > max_window {
            if !catch_up.send_all_missing {
                tracing::warn!(
                    "Lookback window of {} rows exceeds limit {}; clamping",
                    count - window_start,
                    max_window
                );
            }
            window_start = count - max_window;
        }
        let window_len = (count - window_start)
            .max(catch_up.lookback_lines)
            .min(max_window);

        let first_due = if catch_up.send_all_missing {
            resume_point
        } else if catch_up.snapshot {
            window_start
        } else {
            resume_point.max(window_start)
        };

        // Rows below the window are sent but not tracked for updates.
        let tracked_from = first_due.max(window_start);
        let mut watermarks = VecDeque::new();
        if indexed {
            let held = (tracked_from - window_start) as usize;
            watermarks.extend(std::iter::repeat(catch_up.peer_mtime).take(held));
            watermarks
                .extend(std::iter::repeat(f64::NEG_INFINITY).take((count - tracked_from) as usize));
        }

        let cursor = PeerCursor {
            next_row: count,
            window_start,
            window_len,
            watermarks,
            pending: (first_due..count).collect(),
        };

        tracing::debug!(
            "Catch-up resolved: window {}..{} (len {}), {} rows due",
            window_start,
            count,
            window_len,
            cursor.pending.len()
        );

        Ok(Self {
            table,
            cursor,
            indexed,
            max_rows: (limits.max_frame_bytes / row_size).max(1),
        })
    }

    /// The peer's cursor.
    pub fn cursor(&self) -> &PeerCursor {
        &self.cursor
    }

    /// Maximum rows per batch.
    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// The table being replicated.
    pub fn table(&self) -> &Arc<dyn TableStore> {
        &self.table
    }

    /// Next batch of due rows, rescanning the table when the queue is empty.
    ///
    /// Returns `Ok(None)` when the peer is up to date.
    pub fn next_batch(&mut self) -> TableResult<Option<Batch>> {
        if self.cursor.pending.is_empty() {
            self.rescan()?;
        }
        if self.cursor.pending.is_empty() {
            return Ok(None);
        }
        let take = self.max_rows.min(self.cursor.pending.len());
        let rows: Vec<u64> = self.cursor.pending.drain(..take).collect();
        let payload = self.load(&rows)?;
        Ok(Some(Batch { rows, payload }))
    }

    /// Queue new appends and in-place updates as one sorted, de-duplicated set.
    fn rescan(&mut self) -> TableResult<()> {
        let count = self.table.count();
        let cursor = &mut self.cursor;
        if count < cursor.next_row {
            let previous = cursor.next_row;
            cursor.next_row = count;
            cursor.window_start = count;
            cursor.watermarks.clear();
            return Err(TableError::CountRegressed {
                previous,
                current: count,
            });
        }

        let mut due = BTreeSet::new();
        if self.indexed && cursor.next_row > cursor.window_start {
            let current = self
                .table
                .row_mtimes(cursor.window_start, cursor.next_row)?;
            for (offset, (now, seen)) in current.iter().zip(cursor.watermarks.iter()).enumerate() {
                if now > seen {
                    due.insert(cursor.window_start + offset as u64);
                }
            }
        }
        due.extend(cursor.next_row..count);

        if self.indexed {
            let added = (count - cursor.next_row) as usize;
            cursor
                .watermarks
                .extend(std::iter::repeat(f64::NEG_INFINITY).take(added));
        }
        cursor.next_row = count;

        let span = cursor.next_row - cursor.window_start;
        if span > cursor.window_len {
            let excess = span - cursor.window_len;
            cursor.window_start += excess;
            if self.indexed {
                cursor.watermarks.drain(..excess as usize);
            }
        }

        cursor.pending.extend(due);
        Ok(())
    }

    /// Gather record bytes for `rows`, reading contiguous runs in one slice.
    fn load(&mut self, rows: &[u64]) -> TableResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(rows.len() * self.table.row_size());
        for run in contiguous_runs(rows) {
            if self.indexed {
                // Read stamps before data so a concurrent update is resent.
                let stamps = self.table.row_mtimes(run.start, run.end)?;
                for (row, stamp) in run.clone().zip(stamps) {
                    if row >= self.cursor.window_start {
                        let slot = (row - self.cursor.window_start) as usize;
                        if let Some(mark) = self.cursor.watermarks.get_mut(slot) {
                            *mark = stamp;
                        }
                    }
                }
            }
            payload.extend_from_slice(&self.table.slice(run.start, run.end)?);
        }
        Ok(payload)
    }
}

/// Split ascending row indices into maximal contiguous ranges.
fn contiguous_runs(rows: &[u64]) -> Vec<std::ops::Range<u64>> {
    let mut runs: Vec<std::ops::Range<u64>> = Vec::new();
    for &row in rows {
        match runs.last_mut() {
            Some(run) if run.end == row => run.end += 1,
            _ => runs.push(row..row + 1),
        }
    }
    runs
}
