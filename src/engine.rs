//! Service assembly: live store + swappable index + rebuild worker
//!
//! The engine owns the mutable half of the system (the `VectorStore`
//! behind a read-write lock) and the immutable half (the currently loaded
//! `AnnIndex` behind an atomic pointer). Queries are pure reads against
//! whichever index generation is loaded; a finished rebuild publishes its
//! generation with one pointer store, and queries already in flight finish
//! against the generation they started with.
//!
//! The index intentionally lags the store between rebuilds; that staleness
//! window is part of the design, not a defect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

use emblem_core::{
    AnnIndex, BuildConfig, IndexBuilder, ImageCrop, ModelCache, Neighbor, QueryLimits,
    VectorStore,
};

use crate::model::StatsResponse;

/// Engine paths, intervals, and index knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub index_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// Randomized trees per index build.
    pub tree_count: usize,
    /// Query-time candidate budget multiplier.
    pub search_factor: usize,
    /// Bounds on the `k` query parameter.
    pub limits: QueryLimits,
    /// Fixed build seed for reproducible indexes; `None` draws per build.
    pub build_seed: Option<u64>,
    /// Period of the background rebuild loop.
    pub rebuild_interval: Duration,
    /// Generation directories kept on disk (current + rollback).
    pub keep_generations: usize,
}

impl EngineConfig {
    pub fn from_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let store_path = data_dir.join("emblems.evb");
        let index_dir = data_dir.join("indexes");
        let tmp_dir = data_dir.join("tmp");

        Self {
            data_dir,
            store_path,
            index_dir,
            tmp_dir,
            tree_count: 10,
            search_factor: 2,
            limits: QueryLimits::default(),
            build_seed: None,
            rebuild_interval: Duration::from_secs(300),
            keep_generations: 2,
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    pub ingest_total: AtomicU64,
    pub query_total: AtomicU64,
    pub rebuild_total: AtomicU64,
    pub rebuild_failures_total: AtomicU64,
}

/// Result of one rebuild pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Store empty; nothing to index.
    Idle,
    Built { generation: u64, indexed: usize },
}

pub struct Engine {
    config: EngineConfig,
    store: RwLock<VectorStore>,
    index: ArcSwapOption<AnnIndex>,
    models: Option<Arc<ModelCache>>,
    pub metrics: Metrics,
    rebuild_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    next_generation: AtomicU64,
}

impl Engine {
    /// Open the store and reload the newest loadable index generation.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.index_dir)?;
        std::fs::create_dir_all(&config.tmp_dir)?;

        let store = VectorStore::open(&config.store_path)
            .with_context(|| format!("opening store {:?}", config.store_path))?;

        let generations = list_generations(&config.index_dir)?;
        let mut loaded: Option<Arc<AnnIndex>> = None;
        // Newest first; a generation that fails verification falls back to
        // the one before it rather than taking the service down.
        for &(generation, ref dir) in generations.iter().rev() {
            match AnnIndex::load_dir(dir, config.limits) {
                Ok(index) => {
                    loaded = Some(Arc::new(index.with_search_factor(config.search_factor)));
                    break;
                }
                Err(err) => {
                    tracing::warn!(generation, %err, "skipping unloadable index generation");
                }
            }
        }

        let next_generation = generations.last().map(|&(g, _)| g + 1).unwrap_or(1);
        if let Some(index) = &loaded {
            tracing::info!(
                generation = index.generation(),
                indexed = index.len(),
                "index generation loaded"
            );
        }

        Ok(Self {
            config,
            store: RwLock::new(store),
            index: ArcSwapOption::from(loaded),
            models: None,
            metrics: Metrics::default(),
            rebuild_lock: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_generation: AtomicU64::new(next_generation),
        })
    }

    /// Attach the embedding-model cache used by `ingest_crop`.
    pub fn with_models(mut self, models: Arc<ModelCache>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Currently loaded index generation, if any
    pub fn current_index(&self) -> Option<Arc<AnnIndex>> {
        self.index.load_full()
    }

    /// Append a batch of (id, embedding) pairs and persist the store.
    ///
    /// Returns the number actually inserted; ids already present are
    /// skipped. The new entries become searchable at the next rebuild.
    pub fn ingest_batch(&self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<usize> {
        let mut store = self.store.write();
        let inserted = store.append_batch(ids, vectors)?;
        if inserted > 0 {
            store.persist().context("persisting store after append")?;
        }
        drop(store);

        self.metrics
            .ingest_total
            .fetch_add(inserted as u64, Ordering::Relaxed);
        tracing::debug!(batch = ids.len(), inserted, "ingest batch");
        Ok(inserted)
    }

    /// Embed one image crop with a named model variant and ingest it.
    pub fn ingest_crop(&self, id: u64, crop: &ImageCrop, model: &str) -> Result<usize> {
        let models = self
            .models
            .as_ref()
            .ok_or_else(|| anyhow!("no model cache attached"))?;
        let embedder = models.get(model)?;
        let vector = embedder.embed(crop)?;
        self.ingest_batch(&[id], &[vector])
    }

    pub fn query_by_key(&self, id: u64, k: usize) -> Result<Vec<Neighbor>> {
        let index = self.require_index()?;
        self.metrics.query_total.fetch_add(1, Ordering::Relaxed);
        Ok(index.query_by_key(id, k)?)
    }

    pub fn query_by_vector(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let index = self.require_index()?;
        self.metrics.query_total.fetch_add(1, Ordering::Relaxed);
        Ok(index.query_by_vector(vector, k)?)
    }

    pub fn query_random(&self, k: usize) -> Result<Vec<Neighbor>> {
        let index = self.require_index()?;
        self.metrics.query_total.fetch_add(1, Ordering::Relaxed);
        Ok(index.query_random(k)?)
    }

    fn require_index(&self) -> Result<Arc<AnnIndex>> {
        self.current_index()
            .ok_or_else(|| anyhow!("no index generation loaded; run a build first"))
    }

    /// Snapshot the store, build one index generation, and swap it in.
    ///
    /// Serialized by an internal lock so at most one build runs; the build
    /// reads only its snapshot, so appends proceed concurrently.
    pub fn rebuild_once(&self) -> Result<RebuildOutcome> {
        let _guard = self.rebuild_lock.lock();

        let snapshot = self.store.read().snapshot();
        if snapshot.is_empty() {
            return Ok(RebuildOutcome::Idle);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let builder = IndexBuilder::with_cancel(
            BuildConfig {
                index_dir: self.config.index_dir.clone(),
                tmp_dir: self.config.tmp_dir.clone(),
                tree_count: self.config.tree_count,
                leaf_size: emblem_core::forest::DEFAULT_LEAF_SIZE,
                seed: self.config.build_seed,
            },
            self.shutdown.clone(),
        );

        let artifacts = builder
            .build(&snapshot, generation)
            .with_context(|| format!("building index generation {generation}"))?;

        let index = AnnIndex::load_dir(&artifacts.dir, self.config.limits)
            .with_context(|| format!("loading freshly built generation {generation}"))?
            .with_search_factor(self.config.search_factor);

        // Atomic pointer swap: new queries see the new generation, in-flight
        // queries finish on the Arc they already hold.
        self.index.store(Some(Arc::new(index)));
        self.metrics.rebuild_total.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.gc_generations() {
            tracing::warn!(%err, "generation gc failed");
        }

        Ok(RebuildOutcome::Built {
            generation,
            indexed: artifacts.count,
        })
    }

    /// Remove generation directories beyond the retention window.
    ///
    /// Unlinked files stay readable through any still-open memory map, so
    /// an in-flight query on a retired generation is unaffected.
    fn gc_generations(&self) -> Result<()> {
        let generations = list_generations(&self.config.index_dir)?;
        if generations.len() <= self.config.keep_generations {
            return Ok(());
        }
        let cutoff = generations.len() - self.config.keep_generations;
        for (generation, dir) in &generations[..cutoff] {
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("removing retired generation {generation}"))?;
            tracing::info!(generation, "retired index generation removed");
        }
        Ok(())
    }

    /// Spawn the periodic rebuild worker.
    pub fn start_background_workers(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let _ = std::thread::Builder::new()
            .name("emblem-rebuild".to_string())
            .spawn(move || rebuild_loop(engine));
    }

    /// Raise the shutdown flag: stops the rebuild loop and aborts any
    /// build in progress (its tmp artifacts are cleaned up).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Store entry count and dimension under one short read lock
    pub fn store_stats(&self) -> (usize, usize, usize) {
        let store = self.store.read();
        (store.len(), store.dim(), store.capacity())
    }

    pub fn stats(&self) -> StatsResponse {
        let (store_vectors, store_dim, store_capacity) = self.store_stats();
        let index = self.current_index();
        StatsResponse {
            store_vectors,
            store_dim,
            store_capacity,
            index_generation: index.as_ref().and_then(|i| i.generation()),
            indexed_vectors: index.as_ref().map(|i| i.len()),
            ingest_total: self.metrics.ingest_total.load(Ordering::Relaxed),
            query_total: self.metrics.query_total.load(Ordering::Relaxed),
            rebuild_total: self.metrics.rebuild_total.load(Ordering::Relaxed),
            rebuild_failures_total: self
                .metrics
                .rebuild_failures_total
                .load(Ordering::Relaxed),
        }
    }
}

fn rebuild_loop(engine: Arc<Engine>) {
    loop {
        // Sleep in short steps so shutdown is honored promptly.
        let mut slept = Duration::ZERO;
        while slept < engine.config.rebuild_interval {
            if engine.is_shutdown() {
                return;
            }
            let step = Duration::from_millis(200).min(engine.config.rebuild_interval - slept);
            std::thread::sleep(step);
            slept += step;
        }
        if engine.is_shutdown() {
            return;
        }
        match engine.rebuild_once() {
            Ok(RebuildOutcome::Idle) => {}
            Ok(RebuildOutcome::Built {
                generation,
                indexed,
            }) => {
                tracing::info!(generation, indexed, "background rebuild complete");
            }
            Err(err) => {
                engine
                    .metrics
                    .rebuild_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("background rebuild failed: {err:#}");
            }
        }
    }
}

/// Generation directories under `index_dir`, ascending by generation
pub fn list_generations(index_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !index_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(index_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(number) = name.strip_prefix("gen-") else {
            continue;
        };
        if let Ok(generation) = number.parse::<u64>() {
            out.push((generation, path));
        }
    }
    out.sort_by_key(|&(g, _)| g);
    Ok(out)
}
