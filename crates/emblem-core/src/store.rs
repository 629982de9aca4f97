//! Durable embedding storage
//!
//! `VectorStore` is the system of record: an append-only table mapping
//! external ids to fixed-dimension embedding rows, mirrored to one `.evb`
//! file. Appends are idempotent per id and slots are assigned strictly in
//! append order, never reused.
//!
//! # Concurrency
//!
//! The store follows a single-writer discipline. `append_batch` is the only
//! mutation; concurrent appenders from independent processes must serialize
//! through external mutual exclusion (e.g. an advisory lock on the `.evb`
//! path) because slot bookkeeping is not atomic across processes. In-process
//! sharing is handled by the embedding layer above (read-write lock).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

use crate::format::{EvbHeader, EvbWriter, FormatError, HEADER_SIZE};

/// Capacity is pre-allocated in chunks of this many slots to amortize
/// growth; the zeroed tail is written out to disk as-is.
pub const CHUNK_ROWS: usize = 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dimension mismatch: store holds {expected}-dim embeddings, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("batch shape mismatch: {ids} ids but {vectors} vectors")]
    BatchShapeMismatch { ids: usize, vectors: usize },

    #[error("external id {0} is not a valid positive id")]
    InvalidId(u64),

    #[error("alignment error: embedding region not aligned to f32")]
    Alignment,
}

/// Append-only id→embedding table backed by a `.evb` file
#[derive(Debug)]
pub struct VectorStore {
    path: PathBuf,
    /// Embedding rows, `capacity * dim` long; slots `offset..capacity` are a
    /// zeroed pre-allocated tail.
    data: Vec<f32>,
    /// External id per slot, `capacity` long, 0 in the unused tail.
    ids: Vec<u64>,
    /// Reverse map external id → slot.
    slots: HashMap<u64, usize>,
    /// Next free slot; the number of live entries.
    offset: usize,
    /// Allocated slots (multiple of `CHUNK_ROWS` once non-empty).
    capacity: usize,
    /// Fixed once the first entry is written; 0 while empty.
    dim: usize,
}

impl VectorStore {
    /// Open the store at `path`, or start empty if the file does not exist.
    ///
    /// A present but unreadable artifact is a hard error; the store never
    /// silently discards data.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self {
                path,
                data: Vec::new(),
                ids: Vec::new(),
                slots: HashMap::new(),
                offset: 0,
                capacity: 0,
                dim: 0,
            });
        }

        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header = EvbHeader::from_bytes(&mmap)?;
        let expected = header.file_size();
        if mmap.len() < expected {
            return Err(StoreError::Format(FormatError::Truncated {
                expected,
                actual: mmap.len(),
            }));
        }

        let capacity = header.capacity as usize;
        let dim = header.dimensions as usize;

        let emb_bytes = &mmap[HEADER_SIZE..HEADER_SIZE + capacity * dim * 4];
        let data: Vec<f32> = bytemuck::try_cast_slice::<u8, f32>(emb_bytes)
            .map_err(|_| StoreError::Alignment)?
            .to_vec();

        let ids_off = header.ids_offset();
        let id_bytes = &mmap[ids_off..ids_off + capacity * 8];
        let ids: Vec<u64> = id_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        // The on-disk arrays cover the full pre-allocated capacity; the live
        // prefix ends at the last non-zero external id.
        let offset = ids
            .iter()
            .rposition(|&id| id != 0)
            .map(|p| p + 1)
            .unwrap_or(0);

        let mut slots = HashMap::with_capacity(offset);
        for (slot, &id) in ids[..offset].iter().enumerate() {
            slots.insert(id, slot);
        }

        Ok(Self {
            path,
            data,
            ids,
            slots,
            offset,
            capacity,
            dim,
        })
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Next free slot
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Allocated slots including the unused tail
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Embedding dimension; 0 while the store is empty
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains_key(&id)
    }

    /// Embedding for an external id; `None` is the typed not-found outcome.
    pub fn get(&self, id: u64) -> Option<&[f32]> {
        let slot = *self.slots.get(&id)?;
        Some(&self.data[slot * self.dim..(slot + 1) * self.dim])
    }

    #[inline]
    fn row(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    /// Append a batch of (id, embedding) pairs, returning the number
    /// actually inserted.
    ///
    /// Ids already present are skipped, so re-appending is a no-op. The
    /// whole batch is validated before any slot is assigned: on a shape or
    /// dimension violation nothing is mutated. An empty store adopts the
    /// first batch's dimension.
    pub fn append_batch(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<usize, StoreError> {
        if ids.len() != vectors.len() {
            return Err(StoreError::BatchShapeMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        if ids.is_empty() {
            return Ok(0);
        }

        // Id 0 is the on-disk tail sentinel and never a valid external id.
        if let Some(&bad) = ids.iter().find(|&&id| id == 0) {
            return Err(StoreError::InvalidId(bad));
        }

        let expected = if self.dim == 0 {
            vectors[0].len()
        } else {
            self.dim
        };
        for v in vectors {
            if v.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                });
            }
        }
        if expected == 0 {
            return Err(StoreError::DimensionMismatch {
                expected: 0,
                actual: 0,
            });
        }

        self.dim = expected;

        let mut inserted = 0usize;
        for (&id, vector) in ids.iter().zip(vectors.iter()) {
            if self.slots.contains_key(&id) {
                continue;
            }
            self.grow_for(1);

            let slot = self.offset;
            self.data[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(vector);
            self.ids[slot] = id;
            self.slots.insert(id, slot);
            self.offset += 1;
            inserted += 1;
        }

        Ok(inserted)
    }

    /// Ensure capacity for `additional` more slots, growing in whole chunks.
    fn grow_for(&mut self, additional: usize) {
        let needed = self.offset + additional;
        if needed <= self.capacity {
            return;
        }
        let new_capacity = needed.div_ceil(CHUNK_ROWS) * CHUNK_ROWS;
        self.data.resize(new_capacity * self.dim, 0.0);
        self.ids.resize(new_capacity, 0);
        self.capacity = new_capacity;
    }

    /// Iterate live entries as `(external_id, embedding)` in slot order.
    ///
    /// The iterator is lazy and restartable; call again for a fresh pass.
    pub fn iter(&self) -> StoreIter<'_> {
        StoreIter {
            store: self,
            slot: 0,
        }
    }

    /// Take an owned point-in-time copy for index construction.
    ///
    /// The builder only ever reads a snapshot, never the live store, so a
    /// concurrent append stream cannot leak a half-consistent view into a
    /// build.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dim: self.dim,
            ids: self.ids[..self.offset].to_vec(),
            data: self.data[..self.offset * self.dim].to_vec(),
        }
    }

    /// Write the full pre-allocated arrays to disk atomically.
    ///
    /// The artifact is rewritten to a sibling tmp file, synced, then renamed
    /// over `path`; a crash mid-persist leaves the previous file intact.
    pub fn persist(&self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("evb.tmp");

        let mut writer = EvbWriter::new(&tmp, self.capacity, self.dim)?;
        for slot in 0..self.offset {
            writer.write_row(self.ids[slot], self.row(slot))?;
        }
        writer.finish()?;

        std::fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)?;
        Ok(())
    }
}

fn sync_parent(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Iterator over live store entries in slot order
pub struct StoreIter<'a> {
    store: &'a VectorStore,
    slot: usize,
}

impl<'a> Iterator for StoreIter<'a> {
    type Item = (u64, &'a [f32]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot >= self.store.offset {
            return None;
        }
        let slot = self.slot;
        self.slot += 1;
        Some((self.store.ids[slot], self.store.row(slot)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.store.offset - self.slot;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for StoreIter<'a> {}

/// Immutable point-in-time copy of a store's live entries
#[derive(Clone)]
pub struct Snapshot {
    dim: usize,
    ids: Vec<u64>,
    data: Vec<f32>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// External id at a slot
    pub fn id_at(&self, slot: usize) -> u64 {
        self.ids[slot]
    }

    /// Embedding at a slot
    pub fn vector_at(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    /// All embedding rows as one dense slice in slot order
    pub fn dense(&self) -> &[f32] {
        &self.data
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }
}
