//! Deterministic models shared by unit tests

use std::collections::HashMap;
use std::time::Duration;

use ndarray::Array2;

use crate::error::{EngineError, Result};
use crate::model::{EmbeddingsModel, EncodedBatch};

/// Looks query vectors up in a fixed table
#[derive(Clone, Default)]
pub(crate) struct FixedModel {
    vectors: HashMap<String, Vec<f32>>,
    tensor: bool,
}

impl FixedModel {
    pub(crate) fn rows() -> Self {
        Self::default()
    }

    pub(crate) fn tensor() -> Self {
        Self {
            tensor: true,
            ..Self::default()
        }
    }

    pub(crate) fn with(mut self, query: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(query.to_string(), vector);
        self
    }
}

impl EmbeddingsModel for FixedModel {
    fn encode(&self, queries: &[String]) -> Result<EncodedBatch> {
        let rows = queries
            .iter()
            .map(|q| {
                self.vectors
                    .get(q)
                    .cloned()
                    .ok_or_else(|| EngineError::Inference(format!("no vector for `{}`", q)))
            })
            .collect::<Result<Vec<_>>>()?;

        if !self.tensor {
            return Ok(EncodedBatch::Rows(rows));
        }
        let dim = rows.first().map_or(0, Vec::len);
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let tensor = Array2::from_shape_vec((queries.len(), dim), flat)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        Ok(EncodedBatch::Tensor(tensor))
    }

    fn returns_tensor(&self) -> bool {
        self.tensor
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Fails every call
pub(crate) struct FailingModel;

impl EmbeddingsModel for FailingModel {
    fn encode(&self, _queries: &[String]) -> Result<EncodedBatch> {
        Err(EngineError::Inference("model crashed".to_string()))
    }

    fn returns_tensor(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Sleeps before answering like `FixedModel`
pub(crate) struct SlowModel(pub(crate) Duration, pub(crate) FixedModel);

impl EmbeddingsModel for SlowModel {
    fn encode(&self, queries: &[String]) -> Result<EncodedBatch> {
        std::thread::sleep(self.0);
        self.1.encode(queries)
    }

    fn returns_tensor(&self) -> bool {
        self.1.returns_tensor()
    }

    fn name(&self) -> &str {
        "slow"
    }
}
