//! Remote nearest-neighbor service
//!
//! Each query vector is a separate round trip. The calls for one batch run
//! in parallel and their results are collected in input order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::EmbeddingsStore;
use crate::error::{EngineError, Result};
use crate::model::EncodedBatch;
use crate::types::{split_ids, EmbeddingsMatch, EmbeddingsResult};

#[derive(Serialize)]
struct FindNeighborsRequest<'a> {
    queries: [NeighborQuery<'a>; 1],
}

#[derive(Serialize)]
struct NeighborQuery<'a> {
    datapoint: QueryDatapoint<'a>,
    neighbor_count: usize,
}

#[derive(Serialize)]
struct QueryDatapoint<'a> {
    feature_vector: &'a [f32],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindNeighborsResponse {
    #[serde(default)]
    nearest_neighbors: Vec<NearestNeighbors>,
}

#[derive(Deserialize)]
struct NearestNeighbors {
    #[serde(default)]
    neighbors: Vec<Neighbor>,
}

#[derive(Deserialize)]
struct Neighbor {
    datapoint: NeighborDatapoint,
    distance: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NeighborDatapoint {
    #[serde(default)]
    datapoint_id: String,
    #[serde(default)]
    restricts: Vec<Restrict>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Restrict {
    namespace: String,
    #[serde(default)]
    allow_list: Vec<String>,
}

pub struct RemoteStore {
    endpoint: String,
    /// Restrict namespace holding the variable ids
    id_label: String,
    client: reqwest::blocking::Client,
    failed_calls: AtomicU64,
}

impl RemoteStore {
    pub fn new(endpoint: &str, id_label: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::remote(endpoint, e))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            id_label: id_label.to_string(),
            client,
            failed_calls: AtomicU64::new(0),
        })
    }

    /// Per-vector calls that failed since construction
    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    fn find_neighbors(&self, vector: &[f32], top_k: usize) -> Result<EmbeddingsResult> {
        let request = FindNeighborsRequest {
            queries: [NeighborQuery {
                datapoint: QueryDatapoint {
                    feature_vector: vector,
                },
                neighbor_count: top_k,
            }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| EngineError::remote(&self.endpoint, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::remote(&self.endpoint, format!("HTTP {}", status)));
        }

        let body: FindNeighborsResponse = resp
            .json()
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        let neighbors = body
            .nearest_neighbors
            .into_iter()
            .next()
            .map(|n| n.neighbors)
            .unwrap_or_default();

        let mut matches = neighbors
            .into_iter()
            .map(|neighbor| self.to_match(neighbor))
            .collect::<Result<Vec<_>>>()?;

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }

    fn to_match(&self, neighbor: Neighbor) -> Result<EmbeddingsMatch> {
        let score = neighbor.distance.ok_or_else(|| {
            EngineError::MalformedResponse("neighbor without distance".to_string())
        })?;

        let variables: Vec<String> = neighbor
            .datapoint
            .restricts
            .iter()
            .filter(|r| r.namespace == self.id_label)
            .flat_map(|r| r.allow_list.iter().flat_map(|raw| split_ids(raw)))
            .collect();

        if variables.is_empty() {
            return Err(EngineError::MalformedResponse(format!(
                "neighbor `{}` has no `{}` restrict",
                neighbor.datapoint.datapoint_id, self.id_label
            )));
        }

        Ok(EmbeddingsMatch {
            sentence: neighbor.datapoint.datapoint_id,
            score,
            variables,
        })
    }
}

impl EmbeddingsStore for RemoteStore {
    /// A failed call leaves that query without matches; the batch only
    /// fails when every call failed.
    fn vector_search(&self, vectors: EncodedBatch, top_k: usize) -> Result<Vec<EmbeddingsResult>> {
        let queries = vectors.into_rows();
        if top_k == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }

        let outcomes: Vec<Result<EmbeddingsResult>> = queries
            .par_iter()
            .map(|vector| self.find_neighbors(vector, top_k))
            .collect();

        let failures = outcomes.iter().filter(|o| o.is_err()).count();
        if failures == 0 {
            return outcomes.into_iter().collect();
        }

        self.failed_calls.fetch_add(failures as u64, Ordering::Relaxed);

        if failures == outcomes.len() {
            // All failed; surface the first error
            return outcomes.into_iter().collect();
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|e| {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "neighbor lookup failed");
                    Vec::new()
                })
            })
            .collect())
    }

    fn needs_tensor(&self) -> bool {
        false
    }
}
