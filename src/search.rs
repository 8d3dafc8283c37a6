//! Search orchestration: fan out over indexes, then merge, rank and rerank
//!
//! Each index runs on the blocking pool. All of them share one deadline and
//! their results are joined in the order the request named them, so the
//! outcome never depends on which index answered first.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{EngineError, IndexFailure, Result};
use crate::merge::merge_search_results;
use crate::rank::{is_score_sorted, rank_all, RankOptions};
use crate::registry::{Registry, RegistrySnapshot};
use crate::rerank::{rerank, PairScorer};
use crate::types::{QueryCandidates, SearchVarsResult};

/// One search over one or more indexes
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub queries: Vec<String>,
    /// Empty means the configured default indexes
    pub indexes: Vec<String>,
    pub skip_topics: bool,
    pub rerank: bool,
    /// Overrides the configured `top_k`
    pub top_k: Option<usize>,
    /// Caller budget for the whole search. Each index gets the smaller of
    /// this and the configured index timeout; reranking gets whatever is
    /// left, capped by the rerank timeout.
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    pub fn new<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_indexes<I, S>(mut self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes = indexes.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip_topics(mut self, skip: bool) -> Self {
        self.skip_topics = skip;
        self
    }

    pub fn rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Candidates plus the indexes that did not contribute
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub candidates: QueryCandidates,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<IndexFailure>,
    pub reranked: bool,
}

/// Runs searches against the registry's current snapshot
#[derive(Clone)]
pub struct SearchEngine {
    registry: Arc<Registry>,
}

impl SearchEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        // Pin one snapshot for the whole request
        let snapshot = self.registry.snapshot();
        let defaults = snapshot.defaults().clone();

        if request.queries.is_empty() {
            return Ok(SearchOutcome::default());
        }

        let indexes = resolve_indexes(&snapshot, &request.indexes)?;
        let top_k = request
            .top_k
            .unwrap_or_else(|| defaults.top_k_for(request.skip_topics));

        let started = Instant::now();
        // Caller's end-to-end limit, if any. Index tasks are additionally
        // bounded by the index timeout, which never applies to reranking.
        let overall = request.deadline.map(|d| started + d);
        let budget = request
            .deadline
            .map_or(defaults.index_timeout(), |d| d.min(defaults.index_timeout()));
        let deadline = started + budget;

        let queries = Arc::new(request.queries.clone());
        let tasks: Vec<(String, Result<JoinHandle<Result<SearchVarsResult>>>)> = indexes
            .into_iter()
            .map(|name| {
                let task = snapshot.index(&name).map(|embeddings| {
                    let queries = Arc::clone(&queries);
                    tokio::task::spawn_blocking(move || embeddings.vector_search(&queries, top_k))
                });
                (name, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        let mut failures = Vec::new();

        for (name, task) in tasks {
            let outcome = match task {
                Ok(handle) => match tokio::time::timeout_at(deadline, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(EngineError::Inference(format!(
                        "search task failed: {}",
                        join_err
                    ))),
                    Err(_) => Err(EngineError::Timeout {
                        what: format!("index `{}`", name),
                        after: budget,
                    }),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => results.push(ensure_sorted(&name, result)),
                Err(e) => {
                    tracing::warn!("Index {} excluded from search: {}", name, e);
                    failures.push(IndexFailure {
                        index: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if results.is_empty() {
            return Err(EngineError::AllIndexesFailed(failures));
        }

        let merged = merge_search_results(&results);
        let options = RankOptions {
            skip_topics: request.skip_topics,
            score_decimals: defaults.score_decimals,
        };
        let candidates = rank_all(&merged, &options);

        let mut outcome = SearchOutcome {
            candidates,
            failures,
            reranked: false,
        };

        if request.rerank {
            match snapshot.reranker() {
                Some(scorer) => {
                    let limit = match overall {
                        Some(end) => defaults
                            .rerank_timeout()
                            .min(end.saturating_duration_since(Instant::now())),
                        None => defaults.rerank_timeout(),
                    };
                    if let Some(reranked) =
                        rerank_within(Arc::clone(scorer), &outcome.candidates, limit).await
                    {
                        outcome.candidates = reranked;
                        outcome.reranked = true;
                    }
                }
                None => tracing::warn!("Rerank requested but no reranker is loaded"),
            }
        }

        tracing::debug!(
            queries = request.queries.len(),
            indexes = results.len(),
            failed = outcome.failures.len(),
            reranked = outcome.reranked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search done"
        );

        Ok(outcome)
    }
}

/// Requested names, else the configured defaults, else every index
fn resolve_indexes(snapshot: &RegistrySnapshot, requested: &[String]) -> Result<Vec<String>> {
    let names: Vec<String> = if !requested.is_empty() {
        requested.to_vec()
    } else if !snapshot.defaults().default_indexes.is_empty() {
        snapshot.defaults().default_indexes.clone()
    } else {
        snapshot.index_names().map(str::to_string).collect()
    };

    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !snapshot.index_names().any(|known| known == name) {
            return Err(EngineError::UnknownIndex(name));
        }
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    Ok(unique)
}

/// Restore the score-descending order merge relies on
fn ensure_sorted(index: &str, result: SearchVarsResult) -> SearchVarsResult {
    result
        .into_iter()
        .map(|(query, mut matches)| {
            if !is_score_sorted(&matches) {
                tracing::warn!("Index {} returned unsorted matches for {:?}", index, query);
                matches.sort_by(|a, b| b.score.total_cmp(&a.score));
            }
            (query, matches)
        })
        .collect()
}

/// Rerank under `limit`. `None` means keep the input order.
async fn rerank_within(
    scorer: Arc<dyn PairScorer>,
    candidates: &QueryCandidates,
    limit: Duration,
) -> Option<QueryCandidates> {
    let input = candidates.clone();
    let handle = tokio::task::spawn_blocking(move || rerank(scorer.as_ref(), &input));

    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(Ok(reranked))) => Some(reranked),
        Ok(Ok(Err(e))) => {
            tracing::warn!("Rerank skipped: {}", e);
            None
        }
        Ok(Err(join_err)) => {
            tracing::warn!("Rerank skipped: task failed: {}", join_err);
            None
        }
        Err(_) => {
            tracing::warn!("Rerank skipped: timed out after {:?}", limit);
            None
        }
    }
}
