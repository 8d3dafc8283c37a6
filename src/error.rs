//! Error types for the retrieval engine

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, EngineError>;

/// One index that did not contribute to a search
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexFailure {
    pub index: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model `{model}` unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("no embeddings loaded from {path}: {reason}")]
    NoEmbeddingsLoaded { path: String, reason: String },

    #[error("failed to open index table {path}: {reason}")]
    IndexOpen { path: String, reason: String },

    #[error("vector dimension mismatch: store has {expected}, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request to {endpoint} failed: {reason}")]
    Remote { endpoint: String, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("unknown index `{0}`")]
    UnknownIndex(String),

    #[error("index `{index}` unavailable: {reason}")]
    IndexUnavailable { index: String, reason: String },

    #[error("all {} requested indexes failed", .0.len())]
    AllIndexesFailed(Vec<IndexFailure>),

    #[error("rerank failed: {0}")]
    Rerank(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Wrap a reqwest failure against `endpoint`
    pub(crate) fn remote(endpoint: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Remote {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether this error means the backend is not usable at all, as opposed
    /// to a single call going wrong.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            EngineError::ModelUnavailable { .. }
                | EngineError::NoEmbeddingsLoaded { .. }
                | EngineError::IndexOpen { .. }
                | EngineError::Config(_)
        )
    }
}
