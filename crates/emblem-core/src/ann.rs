//! Loaded index and k-NN query operations
//!
//! `AnnIndex` is one immutable, read-only index generation: the `.eft`
//! forest file memory-mapped once at load, the ordered key list, and a
//! reverse external-id→position map built up front. All query operations
//! are pure reads, safe under unbounded concurrent callers; replacing a
//! generation is the owner's concern (an atomic pointer swap above this
//! type), never a mutation of a loaded index.
//!
//! Results are approximate by contract: accuracy is governed by the
//! forest's `tree_count` at build time and the `search_factor` candidate
//! budget at query time, not guaranteed to be the exact k nearest.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use rand::Rng;
use thiserror::Error;

use crate::builder::{sha256_file, IndexManifest, MANIFEST_FILE};
use crate::forest::serialize::{read_forest, ForestFileError};
use crate::forest::RpForest;
use crate::simd::l2_distance_squared;

/// Default candidate budget multiplier: budget = k × tree_count × factor.
pub const DEFAULT_SEARCH_FACTOR: usize = 2;

/// One query hit: an external id and its Euclidean distance to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f32,
}

/// Bounds on the `k` parameter, checked before any search work
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub min_k: usize,
    pub max_k: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            min_k: 1,
            max_k: 500,
        }
    }
}

#[derive(Error, Debug)]
pub enum AnnError {
    #[error("forest artifact error: {0}")]
    Forest(#[from] ForestFileError),

    #[error("key list line {line} is not a valid external id")]
    BadKey { line: usize },

    #[error("key list holds {keys} ids but the forest indexes {indexed} vectors")]
    KeyCountMismatch { keys: usize, indexed: usize },

    #[error("checksum mismatch for {file}; artifact corrupt or tampered")]
    ChecksumMismatch { file: String },

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("vectors region not aligned to f32")]
    Alignment,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("external id {0} is not indexed")]
    NotFound(u64),

    #[error("dimension mismatch: index holds {expected}-dim embeddings, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("k={k} outside the allowed range [{min}, {max}]")]
    KOutOfRange { k: usize, min: usize, max: usize },
}

/// One loaded, immutable index generation
#[derive(Debug)]
pub struct AnnIndex {
    mmap: Mmap,
    vectors_range: Range<usize>,
    forest: RpForest,
    /// External id at each internal position; position order.
    keys: Vec<u64>,
    /// Reverse map, built once at load.
    positions: HashMap<u64, u32>,
    limits: QueryLimits,
    search_factor: usize,
    generation: Option<u64>,
}

impl AnnIndex {
    /// Load one generation directory, verifying manifest checksums.
    pub fn load_dir<P: AsRef<Path>>(dir: P, limits: QueryLimits) -> Result<Self, AnnError> {
        let dir = dir.as_ref();
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest: IndexManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path)?)?;

        let forest_path = dir.join(&manifest.forest_file);
        let keys_path = dir.join(&manifest.keys_file);

        if sha256_file(&forest_path)? != manifest.forest_sha256 {
            return Err(AnnError::ChecksumMismatch {
                file: manifest.forest_file.clone(),
            });
        }
        if sha256_file(&keys_path)? != manifest.keys_sha256 {
            return Err(AnnError::ChecksumMismatch {
                file: manifest.keys_file.clone(),
            });
        }

        let mut index = Self::load(&forest_path, &keys_path, limits)?;
        index.generation = Some(manifest.generation);
        Ok(index)
    }

    /// Load from explicit artifact paths (no manifest verification).
    ///
    /// The forest file is mapped once here and released with the index;
    /// queries read vector rows straight from the map.
    pub fn load<P: AsRef<Path>>(
        forest_path: P,
        keys_path: P,
        limits: QueryLimits,
    ) -> Result<Self, AnnError> {
        let file = File::open(forest_path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let (header, forest) = read_forest(&mmap)?;
        let vectors_range = header.vectors_range();
        if bytemuck::try_cast_slice::<u8, f32>(&mmap[vectors_range.clone()]).is_err() {
            return Err(AnnError::Alignment);
        }

        let keys = read_keys(keys_path.as_ref())?;
        if keys.len() != forest.len() {
            return Err(AnnError::KeyCountMismatch {
                keys: keys.len(),
                indexed: forest.len(),
            });
        }

        let mut positions = HashMap::with_capacity(keys.len());
        for (pos, &id) in keys.iter().enumerate() {
            positions.insert(id, pos as u32);
        }

        Ok(Self {
            mmap,
            vectors_range,
            forest,
            keys,
            positions,
            limits,
            search_factor: DEFAULT_SEARCH_FACTOR,
            generation: None,
        })
    }

    /// Override the query-time candidate budget multiplier.
    pub fn with_search_factor(mut self, search_factor: usize) -> Self {
        self.search_factor = search_factor.max(1);
        self
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Index dimension
    pub fn dim(&self) -> usize {
        self.forest.dim()
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// Whether an external id is present in this generation
    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    #[inline]
    fn vectors(&self) -> &[f32] {
        bytemuck::cast_slice(&self.mmap[self.vectors_range.clone()])
    }

    #[inline]
    fn vector_at(&self, pos: u32) -> &[f32] {
        let dim = self.dim();
        let start = pos as usize * dim;
        &self.vectors()[start..start + dim]
    }

    fn check_k(&self, k: usize) -> Result<(), QueryError> {
        if k < self.limits.min_k || k > self.limits.max_k {
            return Err(QueryError::KOutOfRange {
                k,
                min: self.limits.min_k,
                max: self.limits.max_k,
            });
        }
        Ok(())
    }

    /// k nearest neighbors of an indexed embedding, by external id.
    ///
    /// The queried id itself comes back as `(id, 0.0)`; self-matches are
    /// returned, not filtered.
    pub fn query_by_key(&self, id: u64, k: usize) -> Result<Vec<Neighbor>, QueryError> {
        self.check_k(k)?;
        let pos = *self
            .positions
            .get(&id)
            .ok_or(QueryError::NotFound(id))?;

        let query = self.vector_at(pos);
        let mut candidates = self.forest.candidates(query, self.budget(k));
        // The query point is always a candidate of its own search.
        if !candidates.contains(&pos) {
            candidates.push(pos);
        }
        Ok(self.rank(query, candidates, k))
    }

    /// k nearest neighbors of an arbitrary query vector, which need not be
    /// indexed.
    pub fn query_by_vector(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>, QueryError> {
        self.check_k(k)?;
        if vector.len() != self.dim() {
            return Err(QueryError::DimensionMismatch {
                expected: self.dim(),
                actual: vector.len(),
            });
        }

        let candidates = self.forest.candidates(vector, self.budget(k));
        Ok(self.rank(vector, candidates, k))
    }

    /// k nearest neighbors of one uniformly sampled indexed id.
    pub fn query_random(&self, k: usize) -> Result<Vec<Neighbor>, QueryError> {
        let pick = rand::thread_rng().gen_range(0..self.keys.len());
        self.query_by_key(self.keys[pick], k)
    }

    #[inline]
    fn budget(&self, k: usize) -> usize {
        k.saturating_mul(self.forest.tree_count())
            .saturating_mul(self.search_factor)
            .max(k)
    }

    /// Score candidates exactly and keep the k best, ordered ascending by
    /// distance with ties broken by ascending internal position.
    fn rank(&self, query: &[f32], candidates: Vec<u32>, k: usize) -> Vec<Neighbor> {
        let mut scored: Vec<(f32, u32)> = candidates
            .into_iter()
            .map(|pos| (l2_distance_squared(query, self.vector_at(pos)), pos))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(dist_sq, pos)| Neighbor {
                id: self.keys[pos as usize],
                distance: dist_sq.sqrt(),
            })
            .collect()
    }
}

fn read_keys(path: &Path) -> Result<Vec<u64>, AnnError> {
    let text = std::fs::read_to_string(path)?;
    let mut keys = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let id: u64 = line
            .trim()
            .parse()
            .map_err(|_| AnnError::BadKey { line: line_no + 1 })?;
        keys.push(id);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildConfig, IndexBuilder};
    use crate::store::VectorStore;
    use tempfile::{tempdir, TempDir};

    /// 3 embeddings of dimension 4 for ids [10, 20, 30].
    fn small_index() -> (TempDir, AnnIndex) {
        build_index(
            &[10, 20, 30],
            &[
                vec![0.0, 0.0, 0.0, 0.0],
                vec![1.0, 0.0, 0.0, 0.0],
                vec![10.0, 10.0, 10.0, 10.0],
            ],
        )
    }

    fn build_index(ids: &[u64], vectors: &[Vec<f32>]) -> (TempDir, AnnIndex) {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open(dir.path().join("bank.evb")).unwrap();
        store.append_batch(ids, vectors).unwrap();

        let builder = IndexBuilder::new(BuildConfig {
            index_dir: dir.path().join("indexes"),
            tmp_dir: dir.path().join("tmp"),
            tree_count: 4,
            leaf_size: 8,
            seed: Some(13),
        });
        let artifacts = builder.build(&store.snapshot(), 1).unwrap();
        let index = AnnIndex::load_dir(&artifacts.dir, QueryLimits::default()).unwrap();
        (dir, index)
    }

    #[test]
    fn test_query_by_key_self_match_first() {
        let (_dir, index) = small_index();

        let results = index.query_by_key(20, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 20);
        assert_eq!(results[0].distance, 0.0);
        // Ascending by distance.
        assert!(results[1].distance >= results[0].distance);
        assert_eq!(results[1].id, 10);
    }

    #[test]
    fn test_query_by_key_unknown_id() {
        let (_dir, index) = small_index();
        let err = index.query_by_key(99, 2).unwrap_err();
        assert!(matches!(err, QueryError::NotFound(99)));
    }

    #[test]
    fn test_query_by_vector_unindexed_point() {
        let (_dir, index) = small_index();

        let results = index.query_by_vector(&[0.9, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, 20);
        assert!(results[0].distance > 0.0);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_query_by_vector_dimension_mismatch() {
        let (_dir, index) = small_index();
        let err = index.query_by_vector(&[1.0, 2.0], 2).unwrap_err();
        assert!(matches!(
            err,
            QueryError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_k_bounds() {
        let (_dir, index) = small_index();

        assert!(matches!(
            index.query_by_key(10, 0).unwrap_err(),
            QueryError::KOutOfRange { k: 0, min: 1, max: 500 }
        ));
        assert!(matches!(
            index.query_by_vector(&[0.0; 4], 501).unwrap_err(),
            QueryError::KOutOfRange { k: 501, .. }
        ));
        // Bounds are checked before id resolution: invalid input is
        // rejected before any search work.
        assert!(matches!(
            index.query_by_key(99, 0).unwrap_err(),
            QueryError::KOutOfRange { .. }
        ));
    }

    #[test]
    fn test_k_larger_than_index() {
        let (_dir, index) = small_index();
        let results = index.query_by_key(10, 50).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_query_random_delegates() {
        let (_dir, index) = small_index();
        for _ in 0..10 {
            let results = index.query_random(1).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].distance, 0.0);
            assert!([10, 20, 30].contains(&results[0].id));
        }
    }

    #[test]
    fn test_tie_break_by_position() {
        // Two identical vectors: the earlier position wins the tie.
        let (_dir, index) = build_index(
            &[5, 6, 7],
            &[
                vec![1.0, 1.0],
                vec![1.0, 1.0],
                vec![8.0, 8.0],
            ],
        );

        let results = index.query_by_vector(&[1.0, 1.0], 2).unwrap();
        assert_eq!(results[0].id, 5);
        assert_eq!(results[1].id, 6);
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(results[1].distance, 0.0);
    }

    #[test]
    fn test_contains_and_len() {
        let (_dir, index) = small_index();
        assert_eq!(index.len(), 3);
        assert_eq!(index.dim(), 4);
        assert_eq!(index.generation(), Some(1));
        assert!(index.contains(30));
        assert!(!index.contains(31));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open(dir.path().join("bank.evb")).unwrap();
        store
            .append_batch(&[1, 2], &[vec![1.0, 2.0], vec![3.0, 4.0]])
            .unwrap();
        let builder = IndexBuilder::new(BuildConfig {
            index_dir: dir.path().join("indexes"),
            tmp_dir: dir.path().join("tmp"),
            tree_count: 2,
            leaf_size: 8,
            seed: Some(1),
        });
        let artifacts = builder.build(&store.snapshot(), 1).unwrap();

        // Flip one byte of the key list.
        let mut keys = std::fs::read(&artifacts.keys_path).unwrap();
        keys[0] = b'9';
        std::fs::write(&artifacts.keys_path, keys).unwrap();

        let err = AnnIndex::load_dir(&artifacts.dir, QueryLimits::default()).unwrap_err();
        assert!(matches!(err, AnnError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_recall_on_clustered_data() {
        // 4 tight clusters of 25; by-vector queries at cluster centers must
        // recover mostly cluster members despite the approximate contract.
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for c in 0..4u64 {
            for i in 0..25u64 {
                ids.push(c * 100 + i + 1);
                let base = c as f32 * 50.0;
                vectors.push(vec![
                    base + (i % 5) as f32 * 0.1,
                    base + (i / 5) as f32 * 0.1,
                    base,
                ]);
            }
        }
        let (_dir, index) = build_index(&ids, &vectors);

        let hits = index.query_by_vector(&[100.0, 100.0, 100.0], 10).unwrap();
        assert_eq!(hits.len(), 10);
        let in_cluster = hits.iter().filter(|n| n.id / 100 == 2).count();
        assert!(in_cluster >= 8, "recall too low: {in_cluster}/10");
    }
}
