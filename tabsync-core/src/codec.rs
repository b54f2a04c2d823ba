//! Fixed-width record batches.
//!
//! A batch of `n` records is `n * row_size` bytes in row-major order with no
//! padding. The codec never interprets field contents.

use crate::error::{TableError, TableResult};

/// A contiguous run of fixed-width records.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordBatch {
    row_size: usize,
    data: Vec<u8>,
}

impl RecordBatch {
    /// Wrap raw bytes, checking they hold a whole number of rows.
    pub fn from_bytes(row_size: usize, data: Vec<u8>) -> TableResult<Self> {
        if row_size == 0 {
            return Err(TableError::InvalidRowSize(row_size));
        }
        if data.len() % row_size != 0 {
            return Err(TableError::RaggedBatch {
                len: data.len(),
                row_size,
            });
        }
        Ok(Self { row_size, data })
    }

    /// Pack individual records into one buffer.
    pub fn pack<'a, I>(row_size: usize, rows: I) -> TableResult<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        if row_size == 0 {
            return Err(TableError::InvalidRowSize(row_size));
        }
        let mut data = Vec::new();
        for row in rows {
            if row.len() != row_size {
                return Err(TableError::RowSizeMismatch {
                    expected: row_size,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self { row_size, data })
    }

    /// Width of one record in bytes.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.data.len() / self.row_size
    }

    /// Check if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over records.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[u8]> {
        self.data.chunks_exact(self.row_size)
    }

    /// Borrow the packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Take the packed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for RecordBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatch")
            .field("row_size", &self.row_size)
            .field("rows", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_concatenates_rows_without_padding() {
        let a = [1u8; 4];
        let b = [2u8; 4];
        let batch = RecordBatch::pack(4, [&a[..], &b[..]]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.as_bytes(), &[1, 1, 1, 1, 2, 2, 2, 2]);
        let rows: Vec<&[u8]> = batch.rows().collect();
        assert_eq!(rows, vec![&a[..], &b[..]]);
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let err = RecordBatch::from_bytes(32, vec![0; 33]).unwrap_err();
        assert!(matches!(
            err,
            TableError::RaggedBatch {
                len: 33,
                row_size: 32
            }
        ));
    }

    #[test]
    fn wrong_width_row_is_rejected() {
        let err = RecordBatch::pack(4, [&[0u8; 3][..]]).unwrap_err();
        assert!(matches!(
            err,
            TableError::RowSizeMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn zero_row_size_is_rejected() {
        assert!(RecordBatch::from_bytes(0, Vec::new()).is_err());
        assert!(RecordBatch::pack(0, std::iter::empty()).is_err());
    }

    #[test]
    fn empty_batch() {
        let batch = RecordBatch::from_bytes(8, Vec::new()).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(format!("{batch:?}"), "RecordBatch { row_size: 8, rows: 0 }");
    }
}
