//! Vector stores: nearest-neighbor lookup of query vectors
//!
//! The set of backends is closed; `Store` dispatches over them and is
//! picked from `StoreConfig` when the registry is built.

#[cfg(feature = "ann")]
pub mod ann;
pub mod memory;
pub mod remote;

use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::model::EncodedBatch;
use crate::types::EmbeddingsResult;

#[cfg(feature = "ann")]
pub use ann::{AnnStore, AnnTable};
pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Something that answers nearest-neighbor queries
pub trait EmbeddingsStore: Send + Sync {
    /// One result per input vector, each at most `top_k` long and sorted by
    /// descending score.
    fn vector_search(&self, vectors: EncodedBatch, top_k: usize) -> Result<Vec<EmbeddingsResult>>;

    /// Whether the store wants `EncodedBatch::Tensor` input
    fn needs_tensor(&self) -> bool;
}

pub enum Store {
    Memory(MemoryStore),
    #[cfg(feature = "ann")]
    Ann(AnnStore),
    Remote(RemoteStore),
}

impl Store {
    /// Open the backend described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::Memory { embeddings_path } => {
                MemoryStore::load(embeddings_path).map(Store::Memory)
            }
            #[cfg(feature = "ann")]
            StoreConfig::Ann { embeddings_path } => {
                AnnStore::open(std::path::Path::new(embeddings_path)).map(Store::Ann)
            }
            #[cfg(not(feature = "ann"))]
            StoreConfig::Ann { .. } => Err(EngineError::Config(
                "ann store requested but built without the `ann` feature".to_string(),
            )),
            StoreConfig::Remote {
                endpoint,
                id_label,
                timeout_secs,
            } => RemoteStore::new(endpoint, id_label, Duration::from_secs(*timeout_secs))
                .map(Store::Remote),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            #[cfg(feature = "ann")]
            Store::Ann(_) => "ann",
            Store::Remote(_) => "remote",
        }
    }

    /// Backend calls that failed without failing the whole search. Only
    /// the remote store can lose individual calls.
    pub fn failed_calls(&self) -> u64 {
        match self {
            Store::Remote(s) => s.failed_calls(),
            _ => 0,
        }
    }

    fn inner(&self) -> &dyn EmbeddingsStore {
        match self {
            Store::Memory(s) => s,
            #[cfg(feature = "ann")]
            Store::Ann(s) => s,
            Store::Remote(s) => s,
        }
    }
}

impl EmbeddingsStore for Store {
    fn vector_search(&self, vectors: EncodedBatch, top_k: usize) -> Result<Vec<EmbeddingsResult>> {
        self.inner().vector_search(vectors, top_k)
    }

    fn needs_tensor(&self) -> bool {
        self.inner().needs_tensor()
    }
}

/// Keep the best `top_k` of `(row, score)` pairs, highest score first.
/// Equal scores keep ascending row order so results are reproducible.
pub(crate) fn top_k_rows(scores: impl Iterator<Item = (usize, f32)>, top_k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(top_k);
    ranked
}

/// Check a query width against the store's width
pub(crate) fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(EngineError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_rows_orders_and_truncates() {
        let rows = top_k_rows(vec![(0, 0.2), (1, 0.9), (2, 0.5), (3, 0.9)].into_iter(), 3);
        assert_eq!(rows, vec![(1, 0.9), (3, 0.9), (2, 0.5)]);
    }

    #[test]
    fn test_open_missing_memory_artifact() {
        let config = StoreConfig::Memory {
            embeddings_path: "/nonexistent/embeddings.csv".to_string(),
        };
        assert!(matches!(
            Store::open(&config),
            Err(EngineError::NoEmbeddingsLoaded { .. })
        ));
    }
}
