//! Query API request/response models
//!
//! The wire shapes consumed by an external transport layer: three lookup
//! forms, one ordered response, a stats document, and a typed error body.
//! No transport ships here; these are plain serde types.

use serde::{Deserialize, Serialize};

use emblem_core::{Neighbor, QueryError, StoreError};

fn default_count() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryByKeyRequest {
    pub id: u64,
    #[serde(default = "default_count")]
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryByVectorRequest {
    pub vector: Vec<f32>,
    #[serde(default = "default_count")]
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRandomRequest {
    #[serde(default = "default_count")]
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborItem {
    pub id: u64,
    pub distance: f32,
}

/// Ordered neighbor list plus the number returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<NeighborItem>,
    pub count: usize,
}

impl QueryResponse {
    pub fn from_neighbors(neighbors: Vec<Neighbor>) -> Self {
        let results: Vec<NeighborItem> = neighbors
            .into_iter()
            .map(|n| NeighborItem {
                id: n.id,
                distance: n.distance,
            })
            .collect();
        Self {
            count: results.len(),
            results,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub store_vectors: usize,
    pub store_dim: usize,
    pub store_capacity: usize,
    pub index_generation: Option<u64>,
    pub indexed_vectors: Option<usize>,
    pub ingest_total: u64,
    pub query_total: u64,
    pub rebuild_total: u64,
    pub rebuild_failures_total: u64,
}

/// Machine-readable error shape for the transport layer
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    /// Map an engine error onto a stable code, keeping typed outcomes
    /// (not-found, bad dimension, bad k) distinct from internal failures.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = if let Some(query) = err.downcast_ref::<QueryError>() {
            match query {
                QueryError::NotFound(_) => "not_found",
                QueryError::DimensionMismatch { .. } => "dimension_mismatch",
                QueryError::KOutOfRange { .. } => "k_out_of_range",
            }
        } else if let Some(store) = err.downcast_ref::<StoreError>() {
            match store {
                StoreError::DimensionMismatch { .. } => "dimension_mismatch",
                StoreError::BatchShapeMismatch { .. } | StoreError::InvalidId(_) => "bad_request",
                _ => "storage_error",
            }
        } else {
            "internal"
        };

        Self {
            code,
            message: format!("{err:#}"),
        }
    }
}
