//! Shared ONNX Runtime plumbing for the embedding model and the cross-encoder

use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::{EncodeInput, Tokenizer};

/// Raw output of one batched inference call
pub(crate) struct RawOutput {
    /// Output tensor shape
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    /// Attention mask fed to the model, `batch * seq_len`
    pub attention_mask: Vec<i64>,
    pub seq_len: usize,
}

/// Tokenizer plus ONNX session
pub(crate) struct OnnxRunner {
    // `Session::run` needs `&mut self`
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_seq_len: usize,
}

impl OnnxRunner {
    pub fn load(model_path: &Path, tokenizer_path: &Path, max_seq_len: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {:?}: {}", tokenizer_path, e))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_seq_len: max_seq_len.max(1),
        })
    }

    /// Tokenize `inputs`, pad to the longest sequence and run the model,
    /// returning the tensor named `output`.
    pub fn run<'s, E>(&self, inputs: Vec<E>, output: &str) -> Result<RawOutput>
    where
        E: Into<EncodeInput<'s>> + Send,
    {
        let batch_size = inputs.len();

        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(self.max_seq_len))
            .max()
            .unwrap_or(0)
            .max(1);

        let mut input_ids: Vec<i64> = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask: Vec<i64> = Vec::with_capacity(batch_size * seq_len);
        let mut token_type_ids: Vec<i64> = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let types = encoding.get_type_ids();

            let len = ids.len().min(seq_len);

            for i in 0..len {
                input_ids.push(ids[i] as i64);
                attention_mask.push(mask[i] as i64);
                token_type_ids.push(types[i] as i64);
            }

            for _ in len..seq_len {
                input_ids.push(0);
                attention_mask.push(0);
                token_type_ids.push(0);
            }
        }

        let shape = [batch_size, seq_len];
        let input_ids_tensor = Tensor::from_array((shape, input_ids))?;
        let attention_mask_tensor = Tensor::from_array((shape, attention_mask.clone()))?;
        let token_type_ids_tensor = Tensor::from_array((shape, token_type_ids))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;

        let outputs = session.run(ort::inputs![
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
            "token_type_ids" => token_type_ids_tensor,
        ])?;

        let (output_shape, output_data) = outputs[output]
            .try_extract_tensor::<f32>()
            .with_context(|| format!("Model has no f32 output `{}`", output))?;

        Ok(RawOutput {
            shape: output_shape.iter().map(|&d| d as usize).collect(),
            data: output_data.to_vec(),
            attention_mask,
            seq_len,
        })
    }
}

/// Masked mean pooling of a `[batch, seq, hidden]` output followed by L2
/// normalisation. Returns `batch * hidden` row-major values and `hidden`.
pub(crate) fn mean_pool(output: &RawOutput, batch_size: usize) -> Result<(Vec<f32>, usize)> {
    if output.shape.len() != 3 || output.shape[0] != batch_size {
        anyhow::bail!("unexpected output shape {:?}", output.shape);
    }
    let seq_len = output.shape[1];
    let hidden_dim = output.shape[2];

    let mut pooled = vec![0.0f32; batch_size * hidden_dim];

    for i in 0..batch_size {
        let row = &mut pooled[i * hidden_dim..(i + 1) * hidden_dim];
        let mut count = 0.0f32;

        for j in 0..seq_len.min(output.seq_len) {
            if output.attention_mask[i * output.seq_len + j] > 0 {
                let start = i * seq_len * hidden_dim + j * hidden_dim;
                for (k, value) in row.iter_mut().enumerate() {
                    *value += output.data[start + k];
                }
                count += 1.0;
            }
        }

        if count > 0.0 {
            row.iter_mut().for_each(|x| *x /= count);
        }

        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.iter_mut().for_each(|x| *x /= norm);
        }
    }

    Ok((pooled, hidden_dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_respects_mask() {
        // batch 1, seq 3, hidden 2; last token is padding
        let output = RawOutput {
            shape: vec![1, 3, 2],
            data: vec![1.0, 0.0, 3.0, 0.0, 100.0, 100.0],
            attention_mask: vec![1, 1, 0],
            seq_len: 3,
        };
        let (pooled, dim) = mean_pool(&output, 1).unwrap();
        assert_eq!(dim, 2);
        // mean is [2, 0], normalised to [1, 0]
        assert!((pooled[0] - 1.0).abs() < 1e-6);
        assert!(pooled[1].abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_rejects_bad_shape() {
        let output = RawOutput {
            shape: vec![1, 2],
            data: vec![0.0, 0.0],
            attention_mask: vec![1],
            seq_len: 1,
        };
        assert!(mean_pool(&output, 1).is_err());
    }
}
