//! Exhaustive cosine search over a dense in-memory matrix
//!
//! The artifact is a CSV table with one row per embedded sentence: a `dcid`
//! column (several ids may be joined by `;`), an optional `sentence` column
//! and every other column as an ordered vector component.

use ndarray::{Array2, Axis};
use std::fs::File;
use std::io::{Cursor, Read};

use super::{check_dim, top_k_rows, EmbeddingsStore};
use crate::config::is_uri;
use crate::error::{EngineError, Result};
use crate::model::EncodedBatch;
use crate::types::{split_ids, EmbeddingsMatch, EmbeddingsResult};

pub const ID_COLUMN: &str = "dcid";
pub const SENTENCE_COLUMN: &str = "sentence";

/// One embedded sentence
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub variables: Vec<String>,
    pub sentence: String,
    pub vector: Vec<f32>,
}

pub struct MemoryStore {
    /// L2-normalised, one row per sentence
    vectors: Array2<f32>,
    variables: Vec<Vec<String>>,
    sentences: Vec<String>,
}

impl MemoryStore {
    /// Load an artifact from a local path or an `http(s)://` URI
    pub fn load(location: &str) -> Result<Self> {
        let store = if is_uri(location) {
            if !(location.starts_with("http://") || location.starts_with("https://")) {
                return Err(EngineError::NoEmbeddingsLoaded {
                    path: location.to_string(),
                    reason: "unsupported URI scheme, fetch the artifact locally first".to_string(),
                });
            }
            let bytes = reqwest::blocking::get(location)
                .and_then(|resp| resp.error_for_status())
                .and_then(|resp| resp.bytes())
                .map_err(|e| EngineError::NoEmbeddingsLoaded {
                    path: location.to_string(),
                    reason: e.to_string(),
                })?;
            Self::from_reader(Cursor::new(bytes), location)?
        } else {
            let file = File::open(location).map_err(|e| EngineError::NoEmbeddingsLoaded {
                path: location.to_string(),
                reason: e.to_string(),
            })?;
            Self::from_reader(file, location)?
        };

        tracing::info!(
            "Loaded {} embeddings ({} dims) from {}",
            store.len(),
            store.dim(),
            location
        );
        Ok(store)
    }

    /// Parse a CSV artifact. An artifact without rows or without vector
    /// columns is an error.
    pub fn from_reader<R: Read>(reader: R, source: &str) -> Result<Self> {
        let fail = |reason: String| EngineError::NoEmbeddingsLoaded {
            path: source.to_string(),
            reason,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers().map_err(|e| fail(e.to_string()))?.clone();
        let id_col = headers
            .iter()
            .position(|h| h == ID_COLUMN)
            .ok_or_else(|| fail(format!("missing `{}` column", ID_COLUMN)))?;
        let sentence_col = headers.iter().position(|h| h == SENTENCE_COLUMN);
        let vector_cols: Vec<usize> = (0..headers.len())
            .filter(|&i| i != id_col && Some(i) != sentence_col)
            .collect();
        if vector_cols.is_empty() {
            return Err(fail("no vector columns".to_string()));
        }

        let mut rows = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| fail(e.to_string()))?;
            let variables = split_ids(record.get(id_col).unwrap_or(""));
            if variables.is_empty() {
                tracing::debug!("Skipping row {} of {} without ids", line + 1, source);
                continue;
            }

            let vector = vector_cols
                .iter()
                .map(|&col| {
                    let raw = record.get(col).unwrap_or("");
                    raw.parse::<f32>().map_err(|_| {
                        fail(format!("row {}: `{}` is not a number", line + 1, raw))
                    })
                })
                .collect::<Result<Vec<f32>>>()?;

            rows.push(StoredRow {
                variables,
                sentence: sentence_col
                    .and_then(|col| record.get(col))
                    .unwrap_or("")
                    .to_string(),
                vector,
            });
        }

        if rows.is_empty() {
            return Err(fail("artifact has no rows".to_string()));
        }
        Self::from_rows(rows)
    }

    /// Build from rows already in memory. An empty store is allowed and
    /// answers every query with no matches.
    pub fn from_rows(rows: Vec<StoredRow>) -> Result<Self> {
        let dim = rows.first().map_or(0, |r| r.vector.len());
        let mut flat = Vec::with_capacity(rows.len() * dim);
        let mut variables = Vec::with_capacity(rows.len());
        let mut sentences = Vec::with_capacity(rows.len());

        for row in rows {
            check_dim(dim, row.vector.len())?;
            flat.extend(row.vector);
            variables.push(row.variables);
            sentences.push(row.sentence);
        }

        let mut vectors = Array2::from_shape_vec((variables.len(), dim), flat)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        normalize_rows(&mut vectors);

        Ok(Self {
            vectors,
            variables,
            sentences,
        })
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    /// Stored rows with their normalised vectors
    pub fn rows(&self) -> impl Iterator<Item = StoredRow> + '_ {
        self.vectors
            .outer_iter()
            .zip(self.variables.iter().zip(self.sentences.iter()))
            .map(|(vector, (variables, sentence))| StoredRow {
                variables: variables.clone(),
                sentence: sentence.clone(),
                vector: vector.to_vec(),
            })
    }
}

impl EmbeddingsStore for MemoryStore {
    fn vector_search(&self, vectors: EncodedBatch, top_k: usize) -> Result<Vec<EmbeddingsResult>> {
        let query_count = vectors.len();
        if self.is_empty() || top_k == 0 || query_count == 0 {
            return Ok(vec![Vec::new(); query_count]);
        }

        let mut queries = vectors.into_tensor()?;
        check_dim(self.dim(), queries.ncols())?;
        normalize_rows(&mut queries);

        // [sentences, queries]
        let similarities = self.vectors.dot(&queries.t());

        Ok(similarities
            .axis_iter(Axis(1))
            .map(|column| {
                top_k_rows(column.iter().copied().enumerate(), top_k)
                    .into_iter()
                    .map(|(row, score)| EmbeddingsMatch {
                        sentence: self.sentences[row].clone(),
                        score: score as f64,
                        variables: self.variables[row].clone(),
                    })
                    .collect()
            })
            .collect())
    }

    fn needs_tensor(&self) -> bool {
        true
    }
}

fn normalize_rows(matrix: &mut Array2<f32>) {
    for mut row in matrix.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        }
    }
}
