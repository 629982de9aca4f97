//! Embedding-production boundary
//!
//! The core never extracts features itself: an external collaborator turns
//! an image crop into one fixed-dimension vector, selected by model
//! variant name. This module defines that seam, the `Embedder` trait, and
//! `ModelCache`, which owns model lifecycles explicitly: each variant
//! is loaded at most once and held for the life of the cache, with no
//! eviction. Model loads are expensive; queries against a loaded model
//! are not.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("unknown model variant '{0}'")]
    UnknownModel(String),

    #[error("model load failed for '{name}': {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("invalid image crop: {0}")]
    InvalidCrop(String),
}

/// One image region handed to an embedder
#[derive(Debug, Clone)]
pub struct ImageCrop {
    /// Interleaved RGB bytes, row-major.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageCrop {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self, EmbedError> {
        if pixels.len() != (width as usize) * (height as usize) * 3 {
            return Err(EmbedError::InvalidCrop(format!(
                "{}x{} crop needs {} bytes, got {}",
                width,
                height,
                width as usize * height as usize * 3,
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }
}

/// Produces one fixed-dimension embedding per image crop
pub trait Embedder: Send + Sync {
    /// Model variant name this embedder was loaded as.
    fn model(&self) -> &str;

    /// Output dimension; constant for a loaded model.
    fn dimension(&self) -> usize;

    fn embed(&self, crop: &ImageCrop) -> Result<Vec<f32>, EmbedError>;
}

type Loader = dyn Fn(&str) -> Result<Arc<dyn Embedder>, EmbedError> + Send + Sync;

/// Load-once model registry
///
/// Replaces a process-wide lazily-filled model dictionary with an owned
/// cache object: the loader runs once per variant name, the resulting
/// embedder is shared thereafter, and nothing is evicted until the cache
/// is dropped.
pub struct ModelCache {
    loader: Box<Loader>,
    loaded: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl ModelCache {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn Embedder>, EmbedError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a model, loading it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Embedder>, EmbedError> {
        if let Some(model) = self.loaded.read().get(name) {
            return Ok(model.clone());
        }

        let mut loaded = self.loaded.write();
        // Double-check after taking the write lock; a racing caller may
        // have completed the load.
        if let Some(model) = loaded.get(name) {
            return Ok(model.clone());
        }
        let model = (self.loader)(name)?;
        loaded.insert(name.to_string(), model.clone());
        Ok(model)
    }

    /// Variants currently resident
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubEmbedder {
        name: String,
        dim: usize,
    }

    impl Embedder for StubEmbedder {
        fn model(&self) -> &str {
            &self.name
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn embed(&self, crop: &ImageCrop) -> Result<Vec<f32>, EmbedError> {
            // Deterministic projection of the crop bytes.
            let mut out = vec![0.0f32; self.dim];
            for (i, &b) in crop.pixels.iter().enumerate() {
                out[i % self.dim] += b as f32 / 255.0;
            }
            Ok(out)
        }
    }

    #[test]
    fn test_crop_shape_validation() {
        assert!(ImageCrop::new(vec![0; 12], 2, 2).is_ok());
        assert!(matches!(
            ImageCrop::new(vec![0; 11], 2, 2),
            Err(EmbedError::InvalidCrop(_))
        ));
    }

    #[test]
    fn test_cache_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let cache = ModelCache::new(move |name| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubEmbedder {
                name: name.to_string(),
                dim: 8,
            }) as Arc<dyn Embedder>)
        });

        let a = cache.get("logo-v2").unwrap();
        let b = cache.get("logo-v2").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(a.dimension(), b.dimension());

        cache.get("logo-v3").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.loaded_models(), vec!["logo-v2", "logo-v3"]);
    }

    #[test]
    fn test_load_failure_not_cached() {
        let cache = ModelCache::new(|name| {
            Err(EmbedError::UnknownModel(name.to_string()))
        });

        assert!(matches!(
            cache.get("missing"),
            Err(EmbedError::UnknownModel(_))
        ));
        assert!(cache.loaded_models().is_empty());
    }

    #[test]
    fn test_stub_embeds_fixed_dimension() {
        let embedder = StubEmbedder {
            name: "logo-v2".into(),
            dim: 4,
        };
        let crop = ImageCrop::new(vec![128; 27], 3, 3).unwrap();
        let v = embedder.embed(&crop).unwrap();
        assert_eq!(v.len(), 4);
    }
}
