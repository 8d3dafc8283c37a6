//! Embedding models: turn query strings into vectors
//!
//! A model reports whether its native output is a dense tensor or a list
//! of per-query vectors; the binder converts when the store wants the other
//! representation.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};

/// Query vectors in either representation
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedBatch {
    /// `[queries, dim]` dense matrix
    Tensor(Array2<f32>),
    /// One vector per query
    Rows(Vec<Vec<f32>>),
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        match self {
            EncodedBatch::Tensor(t) => t.nrows(),
            EncodedBatch::Rows(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, EncodedBatch::Tensor(_))
    }

    /// Vector width, `None` when there are no vectors
    pub fn dim(&self) -> Option<usize> {
        match self {
            EncodedBatch::Tensor(t) if t.nrows() > 0 => Some(t.ncols()),
            EncodedBatch::Rows(rows) => rows.first().map(Vec::len),
            _ => None,
        }
    }

    /// Dense form. Fails if rows have differing lengths.
    pub fn into_tensor(self) -> Result<Array2<f32>> {
        match self {
            EncodedBatch::Tensor(t) => Ok(t),
            EncodedBatch::Rows(rows) => {
                let dim = rows.first().map_or(0, Vec::len);
                let mut flat = Vec::with_capacity(rows.len() * dim);
                for row in &rows {
                    if row.len() != dim {
                        return Err(EngineError::DimensionMismatch {
                            expected: dim,
                            actual: row.len(),
                        });
                    }
                    flat.extend_from_slice(row);
                }
                Array2::from_shape_vec((rows.len(), dim), flat)
                    .map_err(|e| EngineError::Inference(e.to_string()))
            }
        }
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        match self {
            EncodedBatch::Tensor(t) => t.outer_iter().map(|row| row.to_vec()).collect(),
            EncodedBatch::Rows(rows) => rows,
        }
    }

    /// Convert to the representation a store asks for
    pub fn into_repr(self, tensor: bool) -> Result<EncodedBatch> {
        match (self, tensor) {
            (batch @ EncodedBatch::Tensor(_), true) | (batch @ EncodedBatch::Rows(_), false) => {
                Ok(batch)
            }
            (batch, true) => Ok(EncodedBatch::Tensor(batch.into_tensor()?)),
            (batch, false) => Ok(EncodedBatch::Rows(batch.into_rows())),
        }
    }
}

/// Something that embeds queries
pub trait EmbeddingsModel: Send + Sync {
    /// One vector per query, in input order
    fn encode(&self, queries: &[String]) -> Result<EncodedBatch>;

    /// Whether `encode` natively produces `EncodedBatch::Tensor`
    fn returns_tensor(&self) -> bool;

    fn name(&self) -> &str;
}

/// Build the model described by `config`. Any failure is reported as
/// `ModelUnavailable`.
pub fn load_model(name: &str, config: &ModelConfig) -> Result<Arc<dyn EmbeddingsModel>> {
    let unavailable = |reason: String| EngineError::ModelUnavailable {
        model: name.to_string(),
        reason,
    };

    match config {
        #[cfg(feature = "onnx")]
        ModelConfig::Onnx {
            model_path,
            tokenizer_path,
            max_seq_len,
        } => {
            let model = OnnxModel::new(name, model_path, tokenizer_path, *max_seq_len)
                .map_err(|e| unavailable(format!("{:#}", e)))?;
            Ok(Arc::new(model))
        }
        #[cfg(not(feature = "onnx"))]
        ModelConfig::Onnx { .. } => Err(unavailable(
            "built without the `onnx` feature".to_string(),
        )),
        ModelConfig::Remote {
            endpoint,
            timeout_secs,
        } => {
            let model = RemoteModel::connect(name, endpoint, Duration::from_secs(*timeout_secs))
                .map_err(|e| unavailable(e.to_string()))?;
            Ok(Arc::new(model))
        }
    }
}

/// Local sentence-transformer run through ONNX Runtime
#[cfg(feature = "onnx")]
pub struct OnnxModel {
    name: String,
    runner: crate::onnx::OnnxRunner,
}

#[cfg(feature = "onnx")]
impl OnnxModel {
    pub fn new(
        name: &str,
        model_path: &std::path::Path,
        tokenizer_path: &std::path::Path,
        max_seq_len: usize,
    ) -> anyhow::Result<Self> {
        tracing::info!("Loading embedding model {} from {:?}", name, model_path);
        let runner = crate::onnx::OnnxRunner::load(model_path, tokenizer_path, max_seq_len)?;
        Ok(Self {
            name: name.to_string(),
            runner,
        })
    }

    fn embed_batch(&self, queries: &[String]) -> anyhow::Result<Array2<f32>> {
        let texts: Vec<&str> = queries.iter().map(String::as_str).collect();
        let output = self.runner.run(texts, "last_hidden_state")?;
        let (pooled, dim) = crate::onnx::mean_pool(&output, queries.len())?;
        Ok(Array2::from_shape_vec((queries.len(), dim), pooled)?)
    }
}

#[cfg(feature = "onnx")]
impl EmbeddingsModel for OnnxModel {
    fn encode(&self, queries: &[String]) -> Result<EncodedBatch> {
        if queries.is_empty() {
            return Ok(EncodedBatch::Tensor(Array2::zeros((0, 0))));
        }
        self.embed_batch(queries)
            .map(EncodedBatch::Tensor)
            .map_err(|e| EngineError::Inference(format!("{:#}", e)))
    }

    fn returns_tensor(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: &'a [String],
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

/// Model served behind an HTTP prediction endpoint
pub struct RemoteModel {
    name: String,
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl RemoteModel {
    /// Build the client and probe the endpoint once, so an unreachable
    /// model is caught at startup.
    pub fn connect(name: &str, endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::remote(endpoint, e))?;

        let model = Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            client,
        };
        model.predict(&["healthcheck".to_string()])?;
        tracing::info!("Connected to remote model {} at {}", name, endpoint);
        Ok(model)
    }

    fn predict(&self, queries: &[String]) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&PredictRequest { instances: queries })
            .send()
            .map_err(|e| EngineError::remote(&self.endpoint, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::remote(&self.endpoint, format!("HTTP {}", status)));
        }

        let body: PredictResponse = resp
            .json()
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        if body.predictions.len() != queries.len() {
            return Err(EngineError::MalformedResponse(format!(
                "expected {} predictions, got {}",
                queries.len(),
                body.predictions.len()
            )));
        }
        Ok(body.predictions)
    }
}

impl EmbeddingsModel for RemoteModel {
    fn encode(&self, queries: &[String]) -> Result<EncodedBatch> {
        if queries.is_empty() {
            return Ok(EncodedBatch::Rows(Vec::new()));
        }
        self.predict(queries).map(EncodedBatch::Rows)
    }

    fn returns_tensor(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn test_tensor_rows_round_trip() {
        let tensor = array![[0.1f32, -0.25, 3.5], [1e-7, 0.0, -42.0]];
        let rows = EncodedBatch::Tensor(tensor.clone()).into_rows();
        assert_eq!(rows, vec![vec![0.1, -0.25, 3.5], vec![1e-7, 0.0, -42.0]]);

        let back = EncodedBatch::Rows(rows).into_tensor().unwrap();
        assert_eq!(back, tensor);
    }

    #[test]
    fn test_into_repr_is_noop_when_matching() {
        let batch = EncodedBatch::Rows(vec![vec![1.0, 2.0]]);
        assert_eq!(batch.clone().into_repr(false).unwrap(), batch);

        let converted = batch.into_repr(true).unwrap();
        assert!(converted.is_tensor());
        assert_eq!(converted.dim(), Some(2));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let batch = EncodedBatch::Rows(vec![vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(
            batch.into_tensor(),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_empty_rows_to_tensor() {
        let tensor = EncodedBatch::Rows(Vec::new()).into_tensor().unwrap();
        assert_eq!(tensor.nrows(), 0);
    }

    #[test]
    fn test_remote_model_encodes_rows() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/predict");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "predictions": [[0.5, 0.5]] }));
        });

        let model =
            RemoteModel::connect("remote", &server.url("/predict"), Duration::from_secs(5)).unwrap();
        let encoded = model.encode(&["median income".to_string()]).unwrap();
        assert!(!model.returns_tensor());
        assert_eq!(encoded, EncodedBatch::Rows(vec![vec![0.5, 0.5]]));
    }

    #[test]
    fn test_remote_model_unreachable_is_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/predict");
            then.status(503);
        });

        let config = ModelConfig::Remote {
            endpoint: server.url("/predict"),
            timeout_secs: 5,
        };
        let err = load_model("remote", &config).err().unwrap();
        assert!(matches!(err, EngineError::ModelUnavailable { .. }));
    }
}
