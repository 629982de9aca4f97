//! Offline index construction
//!
//! `IndexBuilder` turns one store snapshot into one immutable index
//! generation: the `.eft` forest artifact, the `.keys` list mapping
//! internal positions back to external ids, and a manifest with checksums.
//!
//! Builds are long-running batch jobs that run off the serving path.
//! Artifacts are written to a tmp directory first and renamed into the
//! generation directory only once complete, so readers never observe a
//! half-written index; any failure or abort removes the tmp files.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::forest::serialize::{write_forest, ForestFileError};
use crate::forest::{ForestParams, RpForest, DEFAULT_LEAF_SIZE};
use crate::store::Snapshot;

pub const FOREST_FILE: &str = "index.eft";
pub const KEYS_FILE: &str = "index.keys";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot build an index from an empty store")]
    EmptyStore,

    #[error("build aborted")]
    Aborted,

    #[error("forest artifact error: {0}")]
    Forest(#[from] ForestFileError),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build-job parameters
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Generation directories are created under here.
    pub index_dir: PathBuf,
    /// Scratch space for in-progress artifacts.
    pub tmp_dir: PathBuf,
    /// Randomized trees per index.
    pub tree_count: usize,
    /// Maximum items per tree leaf.
    pub leaf_size: usize,
    /// Fixed seed for reproducible builds; `None` draws one per build.
    pub seed: Option<u64>,
}

impl BuildConfig {
    pub fn new(index_dir: PathBuf, tmp_dir: PathBuf, tree_count: usize) -> Self {
        Self {
            index_dir,
            tmp_dir,
            tree_count,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: None,
        }
    }
}

/// Description of one completed generation, written alongside the artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub generation: u64,
    pub created_unix: u64,
    pub dim: usize,
    pub count: usize,
    pub tree_count: usize,
    pub leaf_size: usize,
    pub seed: u64,
    pub forest_file: String,
    pub forest_sha256: String,
    pub keys_file: String,
    pub keys_sha256: String,
}

/// Paths of one published generation
#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    pub generation: u64,
    pub dir: PathBuf,
    pub forest_path: PathBuf,
    pub keys_path: PathBuf,
    pub manifest_path: PathBuf,
    pub count: usize,
    pub dim: usize,
}

pub struct IndexBuilder {
    config: BuildConfig,
    cancel: Arc<AtomicBool>,
}

impl IndexBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builder with an externally shared abort flag (service shutdown).
    pub fn with_cancel(config: BuildConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Raise the abort flag; an in-progress build stops at the next tree
    /// boundary and cleans up its tmp artifacts.
    pub fn abort(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Build one index generation from a snapshot.
    ///
    /// Reads the snapshot in slot order, assigning each vector the dense
    /// internal position matching its slot; line i of the key file is the
    /// external id at position i.
    pub fn build(
        &self,
        snapshot: &Snapshot,
        generation: u64,
    ) -> Result<BuildArtifacts, BuildError> {
        if snapshot.is_empty() {
            return Err(BuildError::EmptyStore);
        }

        std::fs::create_dir_all(&self.config.tmp_dir)?;
        std::fs::create_dir_all(&self.config.index_dir)?;

        let tmp_forest = self.config.tmp_dir.join(format!("gen-{generation}.eft.tmp"));
        let tmp_keys = self.config.tmp_dir.join(format!("gen-{generation}.keys.tmp"));
        let tmp_manifest = self
            .config
            .tmp_dir
            .join(format!("gen-{generation}.manifest.tmp"));

        let result = self.build_inner(snapshot, generation, &tmp_forest, &tmp_keys, &tmp_manifest);

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_forest);
            let _ = std::fs::remove_file(&tmp_keys);
            let _ = std::fs::remove_file(&tmp_manifest);
        }

        result
    }

    fn build_inner(
        &self,
        snapshot: &Snapshot,
        generation: u64,
        tmp_forest: &Path,
        tmp_keys: &Path,
        tmp_manifest: &Path,
    ) -> Result<BuildArtifacts, BuildError> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let params = ForestParams {
            tree_count: self.config.tree_count,
            leaf_size: self.config.leaf_size,
            seed,
        };

        tracing::info!(
            generation,
            count = snapshot.len(),
            dim = snapshot.dim(),
            tree_count = params.tree_count,
            seed,
            "building index generation"
        );

        let forest = RpForest::build(snapshot.dim(), snapshot.dense(), params, &self.cancel)
            .ok_or(BuildError::Aborted)?;

        write_forest(tmp_forest, &forest, snapshot.dense())?;

        let keys_file = File::create(tmp_keys)?;
        let mut w = BufWriter::new(keys_file);
        for &id in snapshot.ids() {
            writeln!(w, "{id}")?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;

        if self.cancel.load(Ordering::Relaxed) {
            return Err(BuildError::Aborted);
        }

        let manifest = IndexManifest {
            generation,
            created_unix: current_unix_ts(),
            dim: snapshot.dim(),
            count: snapshot.len(),
            tree_count: params.tree_count,
            leaf_size: params.leaf_size,
            seed,
            forest_file: FOREST_FILE.to_string(),
            forest_sha256: sha256_file(tmp_forest)?,
            keys_file: KEYS_FILE.to_string(),
            keys_sha256: sha256_file(tmp_keys)?,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(tmp_manifest, manifest_json.as_bytes())?;
        File::open(tmp_manifest)?.sync_all()?;

        let dir = generation_dir(&self.config.index_dir, generation);
        std::fs::create_dir_all(&dir)?;
        let forest_path = dir.join(FOREST_FILE);
        let keys_path = dir.join(KEYS_FILE);
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::rename(tmp_forest, &forest_path)?;
        std::fs::rename(tmp_keys, &keys_path)?;
        std::fs::rename(tmp_manifest, &manifest_path)?;
        sync_dir(&dir)?;
        sync_dir(&self.config.index_dir)?;

        tracing::info!(generation, dir = %dir.display(), "index generation published");

        Ok(BuildArtifacts {
            generation,
            dir,
            forest_path,
            keys_path,
            manifest_path,
            count: snapshot.len(),
            dim: snapshot.dim(),
        })
    }
}

/// Directory name for a generation: zero-padded so lexical order is
/// numeric order.
pub fn generation_dir(index_dir: &Path, generation: u64) -> PathBuf {
    index_dir.join(format!("gen-{generation:08}"))
}

pub(crate) fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}

fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    Ok(())
}

fn current_unix_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;
    use tempfile::tempdir;

    fn config(root: &Path, seed: u64) -> BuildConfig {
        BuildConfig {
            index_dir: root.join("indexes"),
            tmp_dir: root.join("tmp"),
            tree_count: 4,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: Some(seed),
        }
    }

    fn seeded_snapshot() -> crate::store::Snapshot {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open(dir.path().join("bank.evb")).unwrap();
        let ids: Vec<u64> = (1..=40).collect();
        let vectors: Vec<Vec<f32>> = ids
            .iter()
            .map(|&id| vec![id as f32, (id % 7) as f32, -(id as f32), 0.5])
            .collect();
        store.append_batch(&ids, &vectors).unwrap();
        store.snapshot()
    }

    #[test]
    fn test_empty_store_rejected() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("bank.evb")).unwrap();
        let builder = IndexBuilder::new(config(dir.path(), 1));

        let err = builder.build(&store.snapshot(), 1).unwrap_err();
        assert!(matches!(err, BuildError::EmptyStore));
    }

    #[test]
    fn test_build_publishes_artifacts() {
        let dir = tempdir().unwrap();
        let builder = IndexBuilder::new(config(dir.path(), 42));
        let snapshot = seeded_snapshot();

        let artifacts = builder.build(&snapshot, 3).unwrap();
        assert_eq!(artifacts.generation, 3);
        assert_eq!(artifacts.count, 40);
        assert_eq!(artifacts.dim, 4);
        assert!(artifacts.forest_path.exists());
        assert!(artifacts.keys_path.exists());
        assert!(artifacts.manifest_path.exists());
        assert!(artifacts.dir.ends_with("gen-00000003"));

        // Tmp dir left clean.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_key_list_mirrors_slot_order() {
        let dir = tempdir().unwrap();
        let builder = IndexBuilder::new(config(dir.path(), 42));
        let snapshot = seeded_snapshot();

        let artifacts = builder.build(&snapshot, 1).unwrap();
        let keys = std::fs::read_to_string(&artifacts.keys_path).unwrap();
        let parsed: Vec<u64> = keys.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(parsed, snapshot.ids());
    }

    #[test]
    fn test_manifest_checksums_match() {
        let dir = tempdir().unwrap();
        let builder = IndexBuilder::new(config(dir.path(), 42));
        let snapshot = seeded_snapshot();

        let artifacts = builder.build(&snapshot, 1).unwrap();
        let manifest: IndexManifest = serde_json::from_slice(
            &std::fs::read(&artifacts.manifest_path).unwrap(),
        )
        .unwrap();

        assert_eq!(manifest.generation, 1);
        assert_eq!(manifest.seed, 42);
        assert_eq!(
            manifest.forest_sha256,
            sha256_file(&artifacts.forest_path).unwrap()
        );
        assert_eq!(
            manifest.keys_sha256,
            sha256_file(&artifacts.keys_path).unwrap()
        );
    }

    #[test]
    fn test_same_seed_is_byte_identical() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let snapshot = seeded_snapshot();

        let a = IndexBuilder::new(config(dir_a.path(), 9)).build(&snapshot, 1).unwrap();
        let b = IndexBuilder::new(config(dir_b.path(), 9)).build(&snapshot, 1).unwrap();

        assert_eq!(
            std::fs::read(&a.forest_path).unwrap(),
            std::fs::read(&b.forest_path).unwrap()
        );
        assert_eq!(
            std::fs::read(&a.keys_path).unwrap(),
            std::fs::read(&b.keys_path).unwrap()
        );
    }

    #[test]
    fn test_abort_cleans_tmp() {
        let dir = tempdir().unwrap();
        let builder = IndexBuilder::new(config(dir.path(), 1));
        builder.abort();

        let err = builder.build(&seeded_snapshot(), 1).unwrap_err();
        assert!(matches!(err, BuildError::Aborted));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        assert!(!generation_dir(&dir.path().join("indexes"), 1).exists());
    }
}
