//! Table store boundary and an in-memory implementation.
//!
//! The replication engine only ever talks to a [`TableStore`]. Real hosting
//! processes plug in their own storage engine; [`MemoryTable`] covers hosting
//! small tables, demos and tests.
//!
//! Implementations must make `extend`/`upsert` atomic with respect to the
//! `count`/`mtime` they report: a reader that observes a new count must be
//! able to slice every row below it.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::RecordBatch;
use crate::error::{TableError, TableResult};

/// Storage operations the protocol needs from a replicated table.
pub trait TableStore: Send + Sync {
    /// Width of one record in bytes.
    fn row_size(&self) -> usize;

    /// Whether rows are keyed and can be replaced in place.
    fn has_index(&self) -> bool;

    /// Number of rows ever appended.
    fn count(&self) -> u64;

    /// Latest modification time (Unix seconds).
    fn mtime(&self) -> f64;

    /// Append records.
    fn extend(&self, batch: &RecordBatch) -> TableResult<()>;

    /// Replace records with matching keys in place, append the rest.
    fn upsert(&self, batch: &RecordBatch) -> TableResult<()>;

    /// Packed bytes of rows `[lo, hi)`.
    fn slice(&self, lo: u64, hi: u64) -> TableResult<Vec<u8>>;

    /// Modification time of each row in `[lo, hi)`. Indexed tables only.
    fn row_mtimes(&self, lo: u64, hi: u64) -> TableResult<Vec<f64>>;

    /// Index of the first row dated on or after `date`.
    fn row_for_date(&self, date: NaiveDate) -> TableResult<u64>;
}

/// Byte layout of a [`MemoryTable`] record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    /// Width of one record.
    pub row_size: usize,
    /// Key bytes for indexed tables.
    pub key: Option<Range<usize>>,
    /// Offset of a little-endian `f64` modification time.
    pub mtime_offset: Option<usize>,
    /// Offset of a little-endian `i64` Unix-seconds date.
    pub date_offset: Option<usize>,
}

impl TableLayout {
    /// An append-only layout with no known fields.
    pub fn new(row_size: usize) -> Self {
        Self {
            row_size,
            key: None,
            mtime_offset: None,
            date_offset: None,
        }
    }

    /// Make the table indexed on `len` bytes at `offset`.
    pub fn with_key(mut self, offset: usize, len: usize) -> Self {
        self.key = Some(offset..offset + len);
        self
    }

    /// Read row modification times from an `f64` at `offset`.
    pub fn with_mtime(mut self, offset: usize) -> Self {
        self.mtime_offset = Some(offset);
        self
    }

    /// Read row dates from an `i64` at `offset`.
    pub fn with_date(mut self, offset: usize) -> Self {
        self.date_offset = Some(offset);
        self
    }

    /// Check every field fits inside the record.
    pub fn validate(&self) -> TableResult<()> {
        if self.row_size == 0 {
            return Err(TableError::InvalidRowSize(0));
        }
        let fits = |end: usize| end <= self.row_size;
        let key_ok = self
            .key
            .as_ref()
            .map_or(true, |k| !k.is_empty() && fits(k.end));
        let mtime_ok = self.mtime_offset.map_or(true, |o| fits(o + 8));
        let date_ok = self.date_offset.map_or(true, |o| fits(o + 8));
        if key_ok && mtime_ok && date_ok {
            Ok(())
        } else {
            Err(TableError::Rejected(format!(
                "layout fields exceed row size {}",
                self.row_size
            )))
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    index: HashMap<Vec<u8>, u64>,
    stamps: Vec<f64>,
    mtime: f64,
}

/// A table held entirely in memory.
#[derive(Debug)]
pub struct MemoryTable {
    layout: TableLayout,
    inner: RwLock<Inner>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new(layout: TableLayout) -> TableResult<Self> {
        layout.validate()?;
        Ok(Self {
            layout,
            inner: RwLock::new(Inner::default()),
        })
    }

    /// The record layout.
    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Copy of a single row.
    pub fn row(&self, index: u64) -> Option<Vec<u8>> {
        self.slice(index, index + 1).ok()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_width(&self, batch: &RecordBatch) -> TableResult<()> {
        if batch.row_size() != self.layout.row_size {
            return Err(TableError::RowSizeMismatch {
                expected: self.layout.row_size,
                actual: batch.row_size(),
            });
        }
        Ok(())
    }

    fn row_stamp(&self, row: &[u8], now: f64) -> f64 {
        self.layout
            .mtime_offset
            .map(|o| read_f64(row, o))
            .unwrap_or(now)
    }

    fn key_of<'a>(&self, row: &'a [u8]) -> Option<&'a [u8]> {
        self.layout.key.clone().map(|k| &row[k])
    }

    fn push_row(&self, inner: &mut Inner, row: &[u8], now: f64) {
        let index = (inner.data.len() / self.layout.row_size) as u64;
        inner.data.extend_from_slice(row);
        if let Some(key) = self.key_of(row) {
            inner.index.insert(key.to_vec(), index);
            let stamp = self.row_stamp(row, now);
            inner.stamps.push(stamp);
            inner.mtime = inner.mtime.max(stamp);
        } else {
            inner.mtime = inner.mtime.max(self.row_stamp(row, now));
        }
    }

    fn count_of(&self, inner: &Inner) -> u64 {
        (inner.data.len() / self.layout.row_size) as u64
    }

    fn check_range(&self, inner: &Inner, lo: u64, hi: u64) -> TableResult<()> {
        let count = self.count_of(inner);
        if lo > hi || hi > count {
            return Err(TableError::OutOfBounds { lo, hi, count });
        }
        Ok(())
    }
}

impl TableStore for MemoryTable {
    fn row_size(&self) -> usize {
        self.layout.row_size
    }

    fn has_index(&self) -> bool {
        self.layout.key.is_some()
    }

    fn count(&self) -> u64 {
        self.count_of(&self.read())
    }

    fn mtime(&self) -> f64 {
        self.read().mtime
    }

    fn extend(&self, batch: &RecordBatch) -> TableResult<()> {
        self.check_width(batch)?;
        let now = unix_seconds();
        let mut inner = self.write();
        for row in batch.rows() {
            self.push_row(&mut inner, row, now);
        }
        Ok(())
    }

    fn upsert(&self, batch: &RecordBatch) -> TableResult<()> {
        self.check_width(batch)?;
        if !self.has_index() {
            return Err(TableError::NotIndexed);
        }
        let now = unix_seconds();
        let size = self.layout.row_size;
        let mut inner = self.write();
        for row in batch.rows() {
            let existing = self.key_of(row).and_then(|k| inner.index.get(k).copied());
            match existing {
                Some(index) => {
                    let start = index as usize * size;
                    inner.data[start..start + size].copy_from_slice(row);
                    let stamp = self.row_stamp(row, now);
                    inner.stamps[index as usize] = stamp;
                    inner.mtime = inner.mtime.max(stamp);
                }
                None => self.push_row(&mut inner, row, now),
            }
        }
        Ok(())
    }

    fn slice(&self, lo: u64, hi: u64) -> TableResult<Vec<u8>> {
        let inner = self.read();
        self.check_range(&inner, lo, hi)?;
        let size = self.layout.row_size;
        Ok(inner.data[lo as usize * size..hi as usize * size].to_vec())
    }

    fn row_mtimes(&self, lo: u64, hi: u64) -> TableResult<Vec<f64>> {
        if !self.has_index() {
            return Err(TableError::NotIndexed);
        }
        let inner = self.read();
        self.check_range(&inner, lo, hi)?;
        Ok(inner.stamps[lo as usize..hi as usize].to_vec())
    }

    fn row_for_date(&self, date: NaiveDate) -> TableResult<u64> {
        let inner = self.read();
        let count = self.count_of(&inner);
        let Some(offset) = self.layout.date_offset else {
            return Ok(count);
        };
        let target = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(i64::MIN);

        // Rows are appended in date order.
        let size = self.layout.row_size;
        let rows: Vec<&[u8]> = inner.data.chunks_exact(size).collect();
        Ok(rows.partition_point(|row| read_i64(row, offset) < target) as u64)
    }
}

fn read_f64(row: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&row[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

fn read_i64(row: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&row[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

/// Current wall-clock time as floating-point Unix seconds.
pub fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
