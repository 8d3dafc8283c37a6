//! Index and model lifecycle
//!
//! A `RegistrySnapshot` is immutable once built. `Registry` holds the
//! current snapshot behind a lock and swaps the whole `Arc` on reload, so a
//! reader sees either the old mapping or the new one, never a mix.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::config::{EngineConfig, IndexConfig, ModelConfig, SearchDefaults};
use crate::embeddings::Embeddings;
use crate::error::{EngineError, Result};
use crate::model::{load_model, EmbeddingsModel};
use crate::rerank::{load_scorer, PairScorer};
use crate::store::Store;

/// Whether an index can serve queries
#[derive(Clone)]
pub enum IndexState {
    Ready(Arc<Embeddings>),
    Unavailable { reason: String },
}

impl IndexState {
    pub fn is_ready(&self) -> bool {
        matches!(self, IndexState::Ready(_))
    }
}

/// Status line for one index
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStatus {
    pub name: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Backend calls lost since the index was built
    pub failed_calls: u64,
}

#[derive(Clone)]
struct LoadedModel {
    config: ModelConfig,
    model: Arc<dyn EmbeddingsModel>,
}

/// Immutable name → index / model mapping
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    models: HashMap<String, LoadedModel>,
    indexes: BTreeMap<String, IndexState>,
    reranker: Option<Arc<dyn PairScorer>>,
    defaults: SearchDefaults,
}

impl RegistrySnapshot {
    /// Empty snapshot with the given search defaults
    pub fn new(defaults: SearchDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Add a ready index. Mainly for wiring indexes built by hand.
    pub fn with_index(mut self, name: &str, embeddings: Embeddings) -> Self {
        self.indexes
            .insert(name.to_string(), IndexState::Ready(Arc::new(embeddings)));
        self
    }

    pub fn with_unavailable(mut self, name: &str, reason: &str) -> Self {
        self.indexes.insert(
            name.to_string(),
            IndexState::Unavailable {
                reason: reason.to_string(),
            },
        );
        self
    }

    pub fn with_reranker(mut self, scorer: Arc<dyn PairScorer>) -> Self {
        self.reranker = Some(scorer);
        self
    }

    /// Build every model and index in `config`
    pub fn build(config: &EngineConfig) -> Result<Self> {
        Self::build_reusing(config, None)
    }

    /// Like `build`, but models whose config is unchanged in `previous` are
    /// reused instead of loaded again.
    pub fn build_reusing(config: &EngineConfig, previous: Option<&RegistrySnapshot>) -> Result<Self> {
        config.validate()?;

        let mut models = HashMap::new();
        let mut model_errors: HashMap<&str, String> = HashMap::new();

        for (name, model_config) in &config.models {
            let reused = previous
                .and_then(|p| p.models.get(name))
                .filter(|loaded| &loaded.config == model_config);

            if let Some(loaded) = reused {
                tracing::debug!("Reusing loaded model {}", name);
                models.insert(name.clone(), loaded.clone());
                continue;
            }

            match load_model(name, model_config) {
                Ok(model) => {
                    models.insert(
                        name.clone(),
                        LoadedModel {
                            config: model_config.clone(),
                            model,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!("Model {} failed to load: {}", name, e);
                    model_errors.insert(name.as_str(), e.to_string());
                }
            }
        }

        let mut indexes = BTreeMap::new();
        for (name, index_config) in &config.indexes {
            let state = match build_index(name, index_config, &models, &model_errors) {
                Ok(embeddings) => {
                    tracing::info!(
                        "Index {} ready ({} store, model {})",
                        name,
                        embeddings.store().kind(),
                        embeddings.model_name()
                    );
                    IndexState::Ready(Arc::new(embeddings))
                }
                Err(e) => {
                    tracing::error!("Index {} unavailable: {}", name, e);
                    if config.strict {
                        return Err(EngineError::IndexUnavailable {
                            index: name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    IndexState::Unavailable {
                        reason: e.to_string(),
                    }
                }
            };
            indexes.insert(name.clone(), state);
        }

        let reranker = match &config.reranker {
            Some(scorer_config) => match load_scorer(scorer_config) {
                Ok(scorer) => Some(scorer),
                Err(e) => {
                    // Reranking is optional; searches go on without it
                    tracing::warn!("Reranker unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            models,
            indexes,
            reranker,
            defaults: config.search.clone(),
        })
    }

    pub fn defaults(&self) -> &SearchDefaults {
        &self.defaults
    }

    pub fn reranker(&self) -> Option<&Arc<dyn PairScorer>> {
        self.reranker.as_ref()
    }

    pub fn model(&self, name: &str) -> Option<&Arc<dyn EmbeddingsModel>> {
        self.models.get(name).map(|loaded| &loaded.model)
    }

    /// Look up a ready index
    pub fn index(&self, name: &str) -> Result<Arc<Embeddings>> {
        match self.indexes.get(name) {
            Some(IndexState::Ready(embeddings)) => Ok(Arc::clone(embeddings)),
            Some(IndexState::Unavailable { reason }) => Err(EngineError::IndexUnavailable {
                index: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(EngineError::UnknownIndex(name.to_string())),
        }
    }

    /// All configured index names, sorted
    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    pub fn ready_count(&self) -> usize {
        self.indexes.values().filter(|s| s.is_ready()).count()
    }

    pub fn status(&self) -> Vec<IndexStatus> {
        self.indexes
            .iter()
            .map(|(name, state)| match state {
                IndexState::Ready(embeddings) => IndexStatus {
                    name: name.clone(),
                    ready: true,
                    store: Some(embeddings.store().kind()),
                    model: Some(embeddings.model_name().to_string()),
                    reason: None,
                    failed_calls: embeddings.store().failed_calls(),
                },
                IndexState::Unavailable { reason } => IndexStatus {
                    name: name.clone(),
                    ready: false,
                    store: None,
                    model: None,
                    reason: Some(reason.clone()),
                    failed_calls: 0,
                },
            })
            .collect()
    }
}

fn build_index(
    name: &str,
    config: &IndexConfig,
    models: &HashMap<String, LoadedModel>,
    model_errors: &HashMap<&str, String>,
) -> Result<Embeddings> {
    let model = match models.get(&config.model) {
        Some(loaded) => Arc::clone(&loaded.model),
        None => {
            let reason = model_errors
                .get(config.model.as_str())
                .cloned()
                .unwrap_or_else(|| "not configured".to_string());
            return Err(EngineError::ModelUnavailable {
                model: config.model.clone(),
                reason,
            });
        }
    };

    let embeddings = Embeddings::new(model, Store::open(&config.store)?);

    if let Some(query) = config.healthcheck_query.as_deref().filter(|q| !q.is_empty()) {
        embeddings.healthcheck(query).map_err(|e| EngineError::IndexUnavailable {
            index: name.to_string(),
            reason: format!("healthcheck `{}` failed: {}", query, e),
        })?;
    }

    Ok(embeddings)
}

/// Shared handle to the current snapshot
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn build(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(RegistrySnapshot::build(config)?))
    }

    /// The mapping in effect right now. Holding it keeps it alive across a
    /// concurrent reload.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install `snapshot`, returning the one it replaces
    pub fn replace(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let next = Arc::new(snapshot);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Rebuild from `config` and swap it in. The old snapshot stays in
    /// effect if the build fails.
    pub fn reload(&self, config: &EngineConfig) -> Result<()> {
        let previous = self.snapshot();
        let next = RegistrySnapshot::build_reusing(config, Some(&previous))?;
        tracing::info!(
            "Registry reloaded: {} of {} indexes ready",
            next.ready_count(),
            next.indexes.len()
        );
        self.replace(next);
        Ok(())
    }
}
