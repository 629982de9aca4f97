//! .evb Binary File Format
//!
//! The store artifact holds two arrays: an `embedding` matrix and the
//! `external_id` column, written over the full pre-allocated capacity.
//!
//! # File Structure
//!
//! ```text
//! Offset            Size       Type        Description
//! ──────────────────────────────────────────────────────────────
//! 0x00              8          [u8; 8]     Magic: "EMBANK01"
//! 0x08              4          u32 LE      C: Capacity in slots
//! 0x0C              4          u32 LE      D: Dimensions
//! 0x10              C*D*4      [f32]       Embedding rows (LE), slot order
//! 0x10 + C*D*4      C*8        [u64]       External ids (LE), slot order
//! ```
//!
//! Slots past the last assigned one carry an external id of 0; readers
//! truncate at the last non-zero id entry. Id 0 is therefore reserved and
//! never a valid external id.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying a .evb file: "EMBANK01"
pub const MAGIC: [u8; 8] = *b"EMBANK01";

/// Header size in bytes: 8 (magic) + 4 (capacity) + 4 (dims) = 16
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid magic bytes: expected EMBANK01")]
    InvalidMagic,

    #[error("file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("capacity overflow: {0} rows already written")]
    CapacityExceeded(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed .evb file header
#[derive(Debug, Clone, Copy)]
pub struct EvbHeader {
    pub capacity: u32,
    pub dimensions: u32,
}

impl EvbHeader {
    /// Parse header from raw bytes (first 16 bytes of file)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let capacity = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dimensions = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        Ok(Self {
            capacity,
            dimensions,
        })
    }

    /// Write header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf
    }

    /// Byte offset of the embedding row for a slot
    #[inline(always)]
    pub fn embedding_offset(&self, slot: usize) -> usize {
        HEADER_SIZE + slot * self.dimensions as usize * std::mem::size_of::<f32>()
    }

    /// Byte offset of the external-id column
    #[inline(always)]
    pub fn ids_offset(&self) -> usize {
        self.embedding_offset(self.capacity as usize)
    }

    /// Total file size covering both arrays
    pub fn file_size(&self) -> usize {
        self.ids_offset() + self.capacity as usize * std::mem::size_of::<u64>()
    }
}

/// Writer for creating .evb files
///
/// Rows are streamed in slot order; `finish` zero-fills the unused tail of
/// both arrays out to the declared capacity and syncs the file.
pub struct EvbWriter {
    writer: BufWriter<File>,
    capacity: usize,
    dimensions: usize,
    ids: Vec<u64>,
}

impl EvbWriter {
    /// Create a new .evb file writer with a fixed capacity
    pub fn new<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        dimensions: usize,
    ) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = EvbHeader {
            capacity: capacity as u32,
            dimensions: dimensions as u32,
        };
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            capacity,
            dimensions,
            ids: Vec::with_capacity(capacity),
        })
    }

    /// Write one (external id, embedding) row at the next slot
    pub fn write_row(&mut self, id: u64, vector: &[f32]) -> Result<(), FormatError> {
        if vector.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if self.ids.len() >= self.capacity {
            return Err(FormatError::CapacityExceeded(self.capacity));
        }

        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.ids.push(id);
        Ok(())
    }

    /// Zero-fill the tail of both arrays, write the id column, and sync
    pub fn finish(mut self) -> Result<usize, FormatError> {
        let written = self.ids.len();

        let row_bytes = self.dimensions * std::mem::size_of::<f32>();
        let zero_row = vec![0u8; row_bytes];
        for _ in written..self.capacity {
            self.writer.write_all(&zero_row)?;
        }

        for &id in &self.ids {
            self.writer.write_all(&id.to_le_bytes())?;
        }
        let zero_id = 0u64.to_le_bytes();
        for _ in written..self.capacity {
            self.writer.write_all(&zero_id)?;
        }

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let header = EvbHeader {
            capacity: 2048,
            dimensions: 256,
        };
        let bytes = header.to_bytes();
        let parsed = EvbHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.capacity, 2048);
        assert_eq!(parsed.dimensions, 256);
    }

    #[test]
    fn test_offsets() {
        let header = EvbHeader {
            capacity: 100,
            dimensions: 128,
        };

        assert_eq!(header.embedding_offset(0), 16);
        assert_eq!(header.embedding_offset(1), 16 + 128 * 4);
        assert_eq!(header.ids_offset(), 16 + 100 * 128 * 4);
        assert_eq!(header.file_size(), 16 + 100 * 128 * 4 + 100 * 8);
    }

    #[test]
    fn test_writer_zero_fills_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bank.evb");

        let mut writer = EvbWriter::new(&path, 4, 2).unwrap();
        writer.write_row(10, &[1.0, 2.0]).unwrap();
        writer.write_row(20, &[3.0, 4.0]).unwrap();
        let written = writer.finish().unwrap();
        assert_eq!(written, 2);

        let bytes = std::fs::read(&path).unwrap();
        let header = EvbHeader::from_bytes(&bytes).unwrap();
        assert_eq!(bytes.len(), header.file_size());

        // Tail rows are zeroed and tail ids are 0.
        let ids_off = header.ids_offset();
        let id0 = u64::from_le_bytes(bytes[ids_off..ids_off + 8].try_into().unwrap());
        let id3 = u64::from_le_bytes(bytes[ids_off + 24..ids_off + 32].try_into().unwrap());
        assert_eq!(id0, 10);
        assert_eq!(id3, 0);
    }

    #[test]
    fn test_writer_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bank.evb");

        let mut writer = EvbWriter::new(&path, 4, 4).unwrap();
        let result = writer.write_row(1, &[1.0, 2.0, 3.0]);

        assert!(matches!(result, Err(FormatError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = EvbHeader {
            capacity: 1,
            dimensions: 1,
        }
        .to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            EvbHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }
}
