//! Cross-encoder reranking of variable candidates
//!
//! Every (query, evidence sentence) pair across the whole request is scored
//! in a single call. A variable then ranks by its best sentence.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ScorerConfig;
use crate::error::{EngineError, Result};
use crate::types::{QueryCandidates, VarCandidates};

/// Scores (query, sentence) pairs, one float per pair, same order
pub trait PairScorer: Send + Sync {
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f64>>;

    fn name(&self) -> &str;
}

/// Build the scorer described by `config`
pub fn load_scorer(config: &ScorerConfig) -> Result<Arc<dyn PairScorer>> {
    match config {
        #[cfg(feature = "onnx")]
        ScorerConfig::Onnx {
            model_path,
            tokenizer_path,
            max_seq_len,
        } => {
            let scorer = OnnxCrossEncoder::new(model_path, tokenizer_path, *max_seq_len)
                .map_err(|e| EngineError::ModelUnavailable {
                    model: "reranker".to_string(),
                    reason: format!("{:#}", e),
                })?;
            Ok(Arc::new(scorer))
        }
        #[cfg(not(feature = "onnx"))]
        ScorerConfig::Onnx { .. } => Err(EngineError::ModelUnavailable {
            model: "reranker".to_string(),
            reason: "built without the `onnx` feature".to_string(),
        }),
        ScorerConfig::Remote {
            endpoint,
            timeout_secs,
        } => Ok(Arc::new(RemoteScorer::new(
            endpoint,
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}

/// Which variable, and which of its sentences, a scored pair belongs to
struct PairOwner {
    query_idx: usize,
    variable: String,
    sentence_idx: usize,
}

/// Reorder `candidates` by cross-encoder scores. Original `scores` are kept;
/// only variable order and evidence order/annotation change.
pub fn rerank(scorer: &dyn PairScorer, candidates: &QueryCandidates) -> Result<QueryCandidates> {
    let mut pairs = Vec::new();
    let mut owners = Vec::new();

    for (query_idx, (query, cands)) in candidates.iter().enumerate() {
        for variable in &cands.variables {
            let Some(sentences) = cands.evidence.get(variable) else {
                continue;
            };
            for (sentence_idx, sentence) in sentences.iter().enumerate() {
                pairs.push((query.to_string(), sentence.sentence.clone()));
                owners.push(PairOwner {
                    query_idx,
                    variable: variable.clone(),
                    sentence_idx,
                });
            }
        }
    }

    if pairs.is_empty() {
        return Ok(candidates.clone());
    }

    let scores = scorer.score_pairs(&pairs)?;
    if scores.len() != pairs.len() {
        return Err(EngineError::Rerank(format!(
            "{} returned {} scores for {} pairs",
            scorer.name(),
            scores.len(),
            pairs.len()
        )));
    }

    let mut per_query: Vec<Vec<(&PairOwner, f64)>> = vec![Vec::new(); candidates.len()];
    for (owner, score) in owners.iter().zip(scores) {
        per_query[owner.query_idx].push((owner, score));
    }

    Ok(candidates
        .iter()
        .zip(per_query)
        .map(|((query, cands), scored)| (query, reorder(cands, scored)))
        .collect())
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

fn reorder(cands: &VarCandidates, mut scored: Vec<(&PairOwner, f64)>) -> VarCandidates {
    let mut reranked = cands.clone();

    for (owner, score) in &scored {
        if let Some(sentence) = reranked
            .evidence
            .get_mut(&owner.variable)
            .and_then(|s| s.get_mut(owner.sentence_idx))
        {
            sentence.rerank_score = Some(*score);
        }
    }
    for sentences in reranked.evidence.values_mut() {
        sentences.sort_by(|a, b| {
            by_score_desc(
                a.rerank_score.unwrap_or(f64::NEG_INFINITY),
                b.rerank_score.unwrap_or(f64::NEG_INFINITY),
            )
        });
    }

    // Stable: equal rerank scores keep the incoming order
    scored.sort_by(|a, b| by_score_desc(a.1, b.1));

    let mut emitted = HashSet::new();
    let mut order: Vec<&str> = Vec::with_capacity(cands.len());
    for (owner, _) in &scored {
        if emitted.insert(owner.variable.as_str()) {
            order.push(owner.variable.as_str());
        }
    }
    // Variables without evidence keep their relative order at the end
    for variable in &cands.variables {
        if emitted.insert(variable.as_str()) {
            order.push(variable.as_str());
        }
    }

    reranked.variables = order.iter().map(|v| v.to_string()).collect();
    reranked.scores = order
        .iter()
        .map(|v| cands.score_of(v).unwrap_or_default())
        .collect();
    reranked
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    instances: Vec<PairInstance<'a>>,
}

#[derive(Serialize)]
struct PairInstance<'a> {
    query: &'a str,
    sentence: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    predictions: Vec<f64>,
}

/// Cross-encoder served over HTTP
pub struct RemoteScorer {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl RemoteScorer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::remote(endpoint, e))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

impl PairScorer for RemoteScorer {
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f64>> {
        let request = ScoreRequest {
            instances: pairs
                .iter()
                .map(|(query, sentence)| PairInstance { query, sentence })
                .collect(),
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

        let body: ScoreResponse = resp
            .json()
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        Ok(body.predictions)
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// Local cross-encoder; one logit per pair
#[cfg(feature = "onnx")]
pub struct OnnxCrossEncoder {
    runner: crate::onnx::OnnxRunner,
}

#[cfg(feature = "onnx")]
impl OnnxCrossEncoder {
    pub fn new(
        model_path: &std::path::Path,
        tokenizer_path: &std::path::Path,
        max_seq_len: usize,
    ) -> anyhow::Result<Self> {
        tracing::info!("Loading cross-encoder from {:?}", model_path);
        Ok(Self {
            runner: crate::onnx::OnnxRunner::load(model_path, tokenizer_path, max_seq_len)?,
        })
    }

    fn logits(&self, pairs: &[(String, String)]) -> anyhow::Result<Vec<f64>> {
        let inputs: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(q, s)| (q.as_str(), s.as_str()))
            .collect();
        let output = self.runner.run(inputs, "logits")?;

        // [batch, labels]; the first label is the relevance logit
        let labels = match output.shape.as_slice() {
            [batch, labels] if *batch == pairs.len() && *labels > 0 => *labels,
            [batch] if *batch == pairs.len() => 1,
            shape => anyhow::bail!("unexpected logits shape {:?}", shape),
        };
        Ok((0..pairs.len())
            .map(|i| output.data[i * labels] as f64)
            .collect())
    }
}

#[cfg(feature = "onnx")]
impl PairScorer for OnnxCrossEncoder {
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f64>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        self.logits(pairs)
            .map_err(|e| EngineError::Inference(format!("{:#}", e)))
    }

    fn name(&self) -> &str {
        "onnx-cross-encoder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SentenceScore;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Returns canned scores and records what it was asked
    struct CannedScorer {
        scores: Vec<f64>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl CannedScorer {
        fn new(scores: Vec<f64>) -> Self {
            Self {
                scores,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl PairScorer for CannedScorer {
        fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f64>> {
            self.seen.lock().unwrap().extend_from_slice(pairs);
            Ok(self.scores.clone())
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn sentence(text: &str, score: f64) -> SentenceScore {
        SentenceScore {
            sentence: text.to_string(),
            score,
            rerank_score: None,
        }
    }

    fn two_vars() -> QueryCandidates {
        let mut evidence = BTreeMap::new();
        evidence.insert(
            "A".to_string(),
            vec![sentence("a one", 0.989), sentence("a two", 0.898)],
        );
        evidence.insert(
            "B".to_string(),
            vec![sentence("b one", 0.978), sentence("b two", 0.898)],
        );
        [(
            "family earnings",
            VarCandidates {
                variables: vec!["A".to_string(), "B".to_string()],
                scores: vec![0.989, 0.978],
                evidence,
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_best_sentence_decides_order() {
        let scorer = CannedScorer::new(vec![3.0, 1.0, 4.0, 2.0]);
        let reranked = rerank(&scorer, &two_vars()).unwrap();
        let cands = reranked.get("family earnings").unwrap();

        assert_eq!(cands.variables, vec!["B", "A"]);
        // Original scores follow their variables unchanged
        assert_eq!(cands.scores, vec![0.978, 0.989]);

        let a: Vec<_> = cands.evidence["A"]
            .iter()
            .map(|s| (s.sentence.as_str(), s.rerank_score))
            .collect();
        assert_eq!(a, vec![("a one", Some(3.0)), ("a two", Some(1.0))]);

        let b: Vec<_> = cands.evidence["B"]
            .iter()
            .map(|s| (s.sentence.as_str(), s.score, s.rerank_score))
            .collect();
        assert_eq!(
            b,
            vec![("b one", 0.978, Some(4.0)), ("b two", 0.898, Some(2.0))]
        );
    }

    #[test]
    fn test_evidence_resorted_within_variable() {
        let scorer = CannedScorer::new(vec![0.1, 0.9, 0.5, 0.2]);
        let reranked = rerank(&scorer, &two_vars()).unwrap();
        let cands = reranked.get("family earnings").unwrap();
        assert_eq!(cands.variables, vec!["A", "B"]);
        assert_eq!(cands.evidence["A"][0].sentence, "a two");
    }

    #[test]
    fn test_single_batched_call_in_variable_order() {
        let mut candidates = two_vars();
        let mut second = candidates.get("family earnings").unwrap().clone();
        second.variables.reverse();
        second.scores.reverse();
        candidates.insert("second query", second);

        let scorer = CannedScorer::new(vec![0.0; 8]);
        rerank(&scorer, &candidates).unwrap();

        let seen = scorer.seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], ("family earnings".to_string(), "a one".to_string()));
        assert_eq!(seen[4], ("second query".to_string(), "b one".to_string()));
    }

    #[test]
    fn test_score_count_mismatch_is_error() {
        let scorer = CannedScorer::new(vec![1.0]);
        assert!(matches!(
            rerank(&scorer, &two_vars()),
            Err(EngineError::Rerank(_))
        ));
    }

    #[test]
    fn test_variables_without_evidence_go_last() {
        let mut candidates = two_vars();
        let mut cands = candidates.get("family earnings").unwrap().clone();
        cands.variables.insert(0, "NoEvidence".to_string());
        cands.scores.insert(0, 0.99);
        cands.evidence.insert("NoEvidence".to_string(), Vec::new());
        candidates.insert("family earnings", cands);

        let scorer = CannedScorer::new(vec![3.0, 1.0, 4.0, 2.0]);
        let reranked = rerank(&scorer, &candidates).unwrap();
        let cands = reranked.get("family earnings").unwrap();
        assert_eq!(cands.variables, vec!["B", "A", "NoEvidence"]);
        assert_eq!(cands.scores, vec![0.978, 0.989, 0.99]);
    }

    #[test]
    fn test_nothing_to_score_skips_scorer() {
        let candidates: QueryCandidates = [("q", VarCandidates::default())].into_iter().collect();
        let scorer = CannedScorer::new(Vec::new());
        assert_eq!(rerank(&scorer, &candidates).unwrap(), candidates);
        assert!(scorer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remote_scorer() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/rerank");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "predictions": [0.25, 0.75] }));
        });

        let scorer = RemoteScorer::new(&server.url("/rerank"), Duration::from_secs(5)).unwrap();
        let scores = scorer
            .score_pairs(&[
                ("q".to_string(), "s1".to_string()),
                ("q".to_string(), "s2".to_string()),
            ])
            .unwrap();
        assert_eq!(scores, vec![0.25, 0.75]);
    }
}
