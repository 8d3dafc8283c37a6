//! Binds one embedding model to one vector store

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{EngineError, Result};
use crate::model::EmbeddingsModel;
use crate::store::{EmbeddingsStore, Store};
use crate::types::{EmbeddingsResult, SearchVarsResult};

/// A searchable index: model plus store
pub struct Embeddings {
    model: Arc<dyn EmbeddingsModel>,
    store: Store,
}

impl Embeddings {
    pub fn new(model: Arc<dyn EmbeddingsModel>, store: Store) -> Self {
        Self { model, store }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Search every query, returning one entry per distinct query in input
    /// order.
    pub fn vector_search(&self, queries: &[String], top_k: usize) -> Result<SearchVarsResult> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = queries
            .iter()
            .filter(|q| seen.insert(q.as_str()))
            .cloned()
            .collect();

        if unique.is_empty() {
            return Ok(SearchVarsResult::new());
        }
        if top_k == 0 {
            return Ok(unique.into_iter().map(|q| (q, EmbeddingsResult::new())).collect());
        }

        let started = Instant::now();
        let encoded = self.model.encode(&unique)?;
        if encoded.len() != unique.len() {
            return Err(EngineError::Inference(format!(
                "model {} returned {} vectors for {} queries",
                self.model.name(),
                encoded.len(),
                unique.len()
            )));
        }

        let vectors = if self.model.returns_tensor() != self.store.needs_tensor() {
            encoded.into_repr(self.store.needs_tensor())?
        } else {
            encoded
        };

        let results = self.store.vector_search(vectors, top_k)?;
        if results.len() != unique.len() {
            return Err(EngineError::MalformedResponse(format!(
                "{} store returned {} results for {} queries",
                self.store.kind(),
                results.len(),
                unique.len()
            )));
        }

        tracing::debug!(
            model = self.model.name(),
            store = self.store.kind(),
            queries = unique.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vector search done"
        );

        Ok(unique.into_iter().zip(results).collect())
    }

    /// Run `query` once to prove the model and store work together
    pub fn healthcheck(&self, query: &str) -> Result<()> {
        self.vector_search(&[query.to_string()], 1).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FailingModel, FixedModel};

    const ARTIFACT: &str = "\
dcid,sentence,0,1
Count_Person,population,1,0
Median_Income_Person,median income,0,1
";

    fn binder(model: FixedModel) -> Embeddings {
        let store = MemoryStore::from_reader(ARTIFACT.as_bytes(), "inline").unwrap();
        Embeddings::new(Arc::new(model), Store::Memory(store))
    }

    fn queries(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_results_keyed_by_query_in_order() {
        let model = FixedModel::rows()
            .with("income", vec![0.0, 1.0])
            .with("people", vec![1.0, 0.0]);
        let index = binder(model);

        let result = index.vector_search(&queries(&["income", "people"]), 1).unwrap();
        let keys: Vec<_> = result.queries().collect();
        assert_eq!(keys, vec!["income", "people"]);
        assert_eq!(result.get("income").unwrap()[0].variables, vec!["Median_Income_Person"]);
        assert_eq!(result.get("people").unwrap()[0].variables, vec!["Count_Person"]);
    }

    #[test]
    fn test_tensor_model_with_tensor_store() {
        let model = FixedModel::tensor().with("income", vec![0.0, 1.0]);
        let index = binder(model);
        let result = index.vector_search(&queries(&["income"]), 2).unwrap();
        assert_eq!(result.get("income").unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_queries_collapse() {
        let model = FixedModel::rows().with("income", vec![0.0, 1.0]);
        let index = binder(model);
        let result = index
            .vector_search(&queries(&["income", "income"]), 1)
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_boundaries() {
        let index = binder(FixedModel::rows().with("income", vec![0.0, 1.0]));
        assert!(index.vector_search(&[], 5).unwrap().is_empty());

        let result = index.vector_search(&queries(&["income"]), 0).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.get("income").unwrap().is_empty());
    }

    #[test]
    fn test_model_failure_propagates() {
        let store = MemoryStore::from_reader(ARTIFACT.as_bytes(), "inline").unwrap();
        let index = Embeddings::new(Arc::new(FailingModel), Store::Memory(store));
        assert!(index.healthcheck("income").is_err());
    }

    #[test]
    fn test_dimension_mismatch_is_typed() {
        let index = binder(FixedModel::rows().with("income", vec![0.0, 1.0, 0.0]));
        let err = index.vector_search(&queries(&["income"]), 1).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }
}
