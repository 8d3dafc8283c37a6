//! Varsearch Core - statistical variable retrieval engine
//!
//! Turns natural-language queries into ranked statistical-variable
//! candidates by searching one or more embedding indexes, fusing their
//! results, and optionally reranking with a cross-encoder.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod merge;
pub mod model;
#[cfg(feature = "onnx")]
mod onnx;
pub mod rank;
pub mod registry;
pub mod rerank;
pub mod search;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{EngineConfig, IndexConfig, ModelConfig, ScorerConfig, SearchDefaults, StoreConfig};
pub use embeddings::Embeddings;
pub use error::{EngineError, IndexFailure, Result};
pub use merge::{merge_lists, merge_search_results};
pub use model::{load_model, EmbeddingsModel, EncodedBatch};
pub use rank::{rank_all, rank_vars, RankOptions};
pub use registry::{IndexState, IndexStatus, Registry, RegistrySnapshot};
pub use rerank::{load_scorer, rerank, PairScorer};
pub use search::{SearchEngine, SearchOutcome, SearchRequest};
pub use store::{EmbeddingsStore, MemoryStore, RemoteStore, Store};
#[cfg(feature = "ann")]
pub use store::{AnnStore, AnnTable};
pub use types::{
    EmbeddingsMatch, EmbeddingsResult, QueryCandidates, QueryMap, SearchVarsResult, SentenceScore,
    VarCandidates,
};
