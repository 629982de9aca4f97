//! Emblem Core – Embedding store, RP-forest ANN index, and query core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              AnnIndex · k-NN query operations               │
//! │        by key · by vector · random  (read-only, mmap)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │        IndexBuilder → RpForest (.eft) + key list            │
//! │           snapshot in, immutable generation out             │
//! ├─────────────────────────────────────────────────────────────┤
//! │              VectorStore (append-only .evb)                 │
//! │        external id → slot → embedding, system of record     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store accepts idempotent append batches and is the only durable
//! truth. A builder periodically snapshots it and emits an immutable
//! index generation; loaded generations answer approximate k-NN queries
//! and are replaced wholesale, never mutated.

pub mod ann;
pub mod builder;
pub mod embed;
pub mod forest;
pub mod format;
pub mod simd;
pub mod store;

pub use ann::{AnnIndex, Neighbor, QueryError, QueryLimits};
pub use builder::{BuildArtifacts, BuildConfig, BuildError, IndexBuilder, IndexManifest};
pub use embed::{Embedder, EmbedError, ImageCrop, ModelCache};
pub use forest::{ForestParams, RpForest};
pub use simd::{dot_product, l2_distance, l2_distance_squared};
pub use store::{Snapshot, StoreError, VectorStore, CHUNK_ROWS};
