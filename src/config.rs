//! Engine configuration: models, indexes, reranker and search defaults
//!
//! Loaded once from a JSON document. Relative artifact paths are resolved
//! against the directory holding the config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Default number of raw matches requested per index
pub const DEFAULT_TOP_K: usize = 40;

/// Raw matches per index when topic ids are going to be dropped
pub const DEFAULT_TOPIC_TOP_K: usize = 60;

/// Decimals kept when ordering candidates by score
pub const DEFAULT_SCORE_DECIMALS: i32 = 6;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_SEQ_LEN: usize = 256;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_seq_len() -> usize {
    DEFAULT_MAX_SEQ_LEN
}

fn default_id_label() -> String {
    "dcid".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    /// Local sentence-transformer exported to ONNX
    Onnx {
        model_path: PathBuf,
        tokenizer_path: PathBuf,
        #[serde(default = "default_max_seq_len")]
        max_seq_len: usize,
    },
    /// Remote prediction endpoint
    Remote {
        endpoint: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// CSV artifact searched exhaustively in memory
    Memory { embeddings_path: String },
    /// Pre-built on-disk ANN table
    Ann { embeddings_path: String },
    /// Remote nearest-neighbor service
    Remote {
        endpoint: String,
        #[serde(default = "default_id_label")]
        id_label: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Name of an entry in `EngineConfig::models`
    pub model: String,
    pub store: StoreConfig,
    /// Query run once after construction to prove the index works
    #[serde(default)]
    pub healthcheck_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScorerConfig {
    Onnx {
        model_path: PathBuf,
        tokenizer_path: PathBuf,
        #[serde(default = "default_max_seq_len")]
        max_seq_len: usize,
    },
    Remote {
        endpoint: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    /// Indexes searched when a request names none
    pub default_indexes: Vec<String>,
    pub top_k: usize,
    pub topic_top_k: usize,
    pub index_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    pub score_decimals: i32,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            default_indexes: Vec::new(),
            top_k: DEFAULT_TOP_K,
            topic_top_k: DEFAULT_TOPIC_TOP_K,
            index_timeout_ms: 10_000,
            rerank_timeout_ms: 5_000,
            score_decimals: DEFAULT_SCORE_DECIMALS,
        }
    }
}

impl SearchDefaults {
    /// `top_k` to use for a request that did not pick one
    pub fn top_k_for(&self, skip_topics: bool) -> usize {
        if skip_topics {
            self.topic_top_k
        } else {
            self.top_k
        }
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexConfig>,
    #[serde(default)]
    pub reranker: Option<ScorerConfig>,
    #[serde(default)]
    pub search: SearchDefaults,
    /// Refuse to start when any index is unavailable
    #[serde(default)]
    pub strict: bool,
}

impl EngineConfig {
    /// Load from a JSON file, resolving relative paths against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)
            .map_err(|e| EngineError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.top_k == 0 || self.search.topic_top_k == 0 {
            return Err(EngineError::Config(
                "search.top_k and search.topic_top_k must be at least 1".to_string(),
            ));
        }
        if !(0..=15).contains(&self.search.score_decimals) {
            return Err(EngineError::Config(format!(
                "search.score_decimals must be within 0..=15, got {}",
                self.search.score_decimals
            )));
        }
        for name in &self.search.default_indexes {
            if !self.indexes.contains_key(name) {
                return Err(EngineError::Config(format!(
                    "default index `{}` is not configured",
                    name
                )));
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for model in self.models.values_mut() {
            if let ModelConfig::Onnx {
                model_path,
                tokenizer_path,
                ..
            } = model
            {
                *model_path = resolve_path(base, model_path);
                *tokenizer_path = resolve_path(base, tokenizer_path);
            }
        }
        for index in self.indexes.values_mut() {
            match &mut index.store {
                StoreConfig::Memory { embeddings_path } | StoreConfig::Ann { embeddings_path } => {
                    if !is_uri(embeddings_path) {
                        *embeddings_path = resolve_path(base, Path::new(embeddings_path))
                            .to_string_lossy()
                            .into_owned();
                    }
                }
                StoreConfig::Remote { .. } => {}
            }
        }
        if let Some(ScorerConfig::Onnx {
            model_path,
            tokenizer_path,
            ..
        }) = &mut self.reranker
        {
            *model_path = resolve_path(base, model_path);
            *tokenizer_path = resolve_path(base, tokenizer_path);
        }
    }
}

/// Whether an artifact location is a URI rather than a filesystem path
pub fn is_uri(location: &str) -> bool {
    location.contains("://")
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
