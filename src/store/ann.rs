//! HNSW-backed approximate store with an on-disk table
//!
//! The table file holds every embedded row (ids, sentence, vector) as a
//! versioned bincode blob. The HNSW graph is rebuilt from it on open.

use hnsw_rs::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::memory::{MemoryStore, StoredRow};
use super::{check_dim, top_k_rows, EmbeddingsStore};
use crate::error::{EngineError, Result};
use crate::model::EncodedBatch;
use crate::types::{EmbeddingsMatch, EmbeddingsResult};

/// Leading byte of every table file
const TABLE_VERSION: u8 = 1;

const MAX_NB_CONNECTION: usize = 32;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnnRow {
    variables: Vec<String>,
    sentence: String,
    vector: Vec<f32>,
}

/// Persisted rows of an ANN index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnTable {
    dim: usize,
    rows: Vec<AnnRow>,
}

impl AnnTable {
    pub fn from_rows(rows: impl IntoIterator<Item = StoredRow>) -> Result<Self> {
        let mut dim = None;
        let mut table_rows = Vec::new();
        for row in rows {
            let expected = *dim.get_or_insert(row.vector.len());
            check_dim(expected, row.vector.len())?;
            table_rows.push(AnnRow {
                variables: row.variables,
                sentence: row.sentence,
                vector: row.vector,
            });
        }
        Ok(Self {
            dim: dim.unwrap_or(0),
            rows: table_rows,
        })
    }

    pub fn from_memory_store(store: &MemoryStore) -> Result<Self> {
        Self::from_rows(store.rows())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let fail = |reason: String| EngineError::IndexOpen {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }

        let mut bytes = vec![TABLE_VERSION];
        bytes.extend(
            bincode::serde::encode_to_vec(self, bincode::config::standard())
                .map_err(|e| fail(e.to_string()))?,
        );
        fs::write(path, bytes).map_err(|e| fail(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let fail = |reason: String| EngineError::IndexOpen {
            path: path.display().to_string(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| fail(e.to_string()))?;
        match bytes.split_first() {
            Some((&TABLE_VERSION, payload)) => {
                let (table, _): (AnnTable, usize) =
                    bincode::serde::decode_from_slice(payload, bincode::config::standard())
                        .map_err(|e| fail(e.to_string()))?;
                if table.rows.iter().any(|r| r.vector.len() != table.dim) {
                    return Err(fail("row width differs from table width".to_string()));
                }
                Ok(table)
            }
            Some((version, _)) => Err(fail(format!("unsupported table version {}", version))),
            None => Err(fail("empty file".to_string())),
        }
    }
}

pub struct AnnStore {
    hnsw: Hnsw<'static, f32, DistCosine>,
    table: AnnTable,
}

impl AnnStore {
    pub fn open(path: &Path) -> Result<Self> {
        let table = AnnTable::load(path)?;
        let store = Self::from_table(table);
        tracing::info!(
            "Opened ANN table {:?} with {} rows ({} dims)",
            path,
            store.table.len(),
            store.table.dim()
        );
        Ok(store)
    }

    pub fn from_table(table: AnnTable) -> Self {
        let hnsw = Hnsw::new(
            MAX_NB_CONNECTION,
            table.len().max(1),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine {},
        );

        for (id, row) in table.rows.iter().enumerate() {
            hnsw.insert((row.vector.as_slice(), id));
        }

        Self { hnsw, table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn search_one(&self, query: &[f32], top_k: usize) -> Result<EmbeddingsResult> {
        check_dim(self.table.dim, query.len())?;

        // DistCosine puts a zero vector at distance 0 from everything. It has
        // no direction, so it scores 0 against every row, in row order.
        if query.iter().all(|x| *x == 0.0) {
            let scored = (0..self.table.len()).map(|id| (id, 0.0));
            return Ok(self.to_matches(top_k_rows(scored, top_k)));
        }

        let ef_search = (top_k * 2).max(100);
        let neighbours = self.hnsw.search(query, top_k, ef_search);

        // Cosine distance to similarity
        let scored = neighbours
            .into_iter()
            .filter(|n| n.d_id < self.table.len())
            .map(|n| (n.d_id, 1.0 - n.distance));

        Ok(self.to_matches(top_k_rows(scored, top_k)))
    }

    fn to_matches(&self, ranked: Vec<(usize, f32)>) -> EmbeddingsResult {
        ranked
            .into_iter()
            .map(|(id, score)| {
                let row = &self.table.rows[id];
                EmbeddingsMatch {
                    sentence: row.sentence.clone(),
                    score: score as f64,
                    variables: row.variables.clone(),
                }
            })
            .collect()
    }
}

impl EmbeddingsStore for AnnStore {
    fn vector_search(&self, vectors: EncodedBatch, top_k: usize) -> Result<Vec<EmbeddingsResult>> {
        let queries = vectors.into_rows();
        if self.is_empty() || top_k == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }

        queries
            .par_iter()
            .map(|query| self.search_one(query, top_k))
            .collect()
    }

    fn needs_tensor(&self) -> bool {
        false
    }
}
