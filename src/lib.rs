//! Emblem-DB: persistent image-embedding store with periodic ANN builds
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                external transport (not here)                │
//! │           by-key / by-vector / random lookups               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Engine (this crate)                        │
//! │   RwLock<VectorStore> · ArcSwap<AnnIndex> · rebuild loop    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 emblem-core                                 │
//! │   .evb store · RP forest (.eft) · builder · query ops       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers append embeddings to the store; a background worker
//! periodically snapshots it, builds an immutable index generation, and
//! swaps it in atomically while readers keep querying.

pub mod engine;
pub mod model;

pub use engine::{Engine, EngineConfig, Metrics, RebuildOutcome};
pub use model::{ErrorBody, QueryResponse, StatsResponse};
