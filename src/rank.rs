//! Collapse merged sentence matches into unique variable candidates

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::DEFAULT_SCORE_DECIMALS;
use crate::types::{
    is_topic, EmbeddingsResult, QueryCandidates, SearchVarsResult, SentenceScore, VarCandidates,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankOptions {
    /// Drop `dc/topic/` ids
    pub skip_topics: bool,
    /// Decimals kept when comparing scores. Absorbs jitter between model
    /// runs so equal-looking scores fall back to id order.
    pub score_decimals: i32,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            skip_topics: false,
            score_decimals: DEFAULT_SCORE_DECIMALS,
        }
    }
}

fn round_score(score: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (score * factor).round() / factor
}

/// Rank one merged, score-descending result list
pub fn rank_vars(merged: &EmbeddingsResult, options: &RankOptions) -> VarCandidates {
    let mut first_score: HashMap<&str, f64> = HashMap::new();
    let mut evidence: BTreeMap<String, Vec<SentenceScore>> = BTreeMap::new();

    for matched in merged {
        for var in &matched.variables {
            if options.skip_topics && is_topic(var) {
                continue;
            }

            // The stream is sorted, so the first sighting is the best score
            first_score.entry(var.as_str()).or_insert(matched.score);
            let sentences = evidence.entry(var.clone()).or_default();

            if !matched.sentence.is_empty()
                && !sentences.iter().any(|s| s.sentence == matched.sentence)
            {
                sentences.push(SentenceScore {
                    sentence: matched.sentence.clone(),
                    score: matched.score,
                    rerank_score: None,
                });
            }
        }
    }

    let mut ranked: Vec<(&str, f64)> = first_score.into_iter().collect();
    ranked.sort_by(|a, b| {
        let ra = round_score(a.1, options.score_decimals);
        let rb = round_score(b.1, options.score_decimals);
        rb.total_cmp(&ra).then_with(|| a.0.cmp(b.0))
    });

    let (variables, scores): (Vec<String>, Vec<f64>) = ranked
        .into_iter()
        .map(|(var, score)| (var.to_string(), score))
        .unzip();

    VarCandidates {
        variables,
        scores,
        evidence,
    }
}

/// Rank every query of a merged search result, keeping query order
pub fn rank_all(merged: &SearchVarsResult, options: &RankOptions) -> QueryCandidates {
    merged
        .iter()
        .map(|(query, result)| (query, rank_vars(result, options)))
        .collect()
}

/// Score-descending check used by callers that assemble results by hand
pub fn is_score_sorted(result: &EmbeddingsResult) -> bool {
    result
        .windows(2)
        .all(|w| w[0].score.total_cmp(&w[1].score) != Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmbeddingsMatch;

    fn m(score: f64, sentence: &str, vars: &[&str]) -> EmbeddingsMatch {
        EmbeddingsMatch::new(sentence, score, vars.iter().map(|v| v.to_string()).collect())
    }

    fn merged() -> EmbeddingsResult {
        vec![
            m(0.90, "below poverty", &["Count_Person_BelowPovertyLevel"]),
            m(0.85, "poverty", &["Count_Person_BelowPovertyLevel", "dc/topic/Poverty"]),
            m(0.80, "above poverty", &["Count_AbovePovertyLevel"]),
            m(0.75, "below poverty", &["Count_Person_BelowPovertyLevel"]),
            m(0.70, "poverty topic", &["dc/topic/Poverty"]),
            m(0.70, "", &["Household_BelowPovertyLevel"]),
        ]
    }

    #[test]
    fn test_each_variable_once_with_max_score() {
        let candidates = rank_vars(&merged(), &RankOptions::default());
        assert_eq!(
            candidates.variables,
            vec![
                "Count_Person_BelowPovertyLevel",
                "dc/topic/Poverty",
                "Count_AbovePovertyLevel",
                "Household_BelowPovertyLevel",
            ]
        );
        assert_eq!(candidates.scores, vec![0.90, 0.85, 0.80, 0.70]);
        assert_eq!(candidates.score_of("dc/topic/Poverty"), Some(0.85));
    }

    #[test]
    fn test_evidence_unique_and_ordered() {
        let candidates = rank_vars(&merged(), &RankOptions::default());
        let evidence = &candidates.evidence["Count_Person_BelowPovertyLevel"];
        let sentences: Vec<_> = evidence.iter().map(|s| s.sentence.as_str()).collect();
        assert_eq!(sentences, vec!["below poverty", "poverty"]);
        assert_eq!(evidence[0].score, 0.90);

        // Empty sentences are not evidence
        assert!(candidates.evidence["Household_BelowPovertyLevel"].is_empty());
    }

    #[test]
    fn test_skip_topics() {
        let options = RankOptions {
            skip_topics: true,
            ..RankOptions::default()
        };
        let candidates = rank_vars(&merged(), &options);
        assert!(candidates.variables.iter().all(|v| !is_topic(v)));
        assert!(!candidates.evidence.contains_key("dc/topic/Poverty"));
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_ranking_is_idempotent() {
        let input = merged();
        let options = RankOptions::default();
        assert_eq!(rank_vars(&input, &options), rank_vars(&input, &options));
    }

    #[test]
    fn test_rounding_jitter_falls_back_to_id_order() {
        let input = vec![
            m(0.812_345_670_1, "b", &["Zeta"]),
            m(0.812_345_669_9, "a", &["Alpha"]),
        ];
        let candidates = rank_vars(&input, &RankOptions::default());
        assert_eq!(candidates.variables, vec!["Alpha", "Zeta"]);
        // Recorded scores are the raw ones
        assert_eq!(candidates.scores[1], 0.812_345_670_1);
    }

    #[test]
    fn test_rank_all_keeps_query_order() {
        let merged: SearchVarsResult = [
            ("second", vec![m(0.5, "x", &["X"])]),
            ("first", Vec::new()),
        ]
        .into_iter()
        .collect();
        let ranked = rank_all(&merged, &RankOptions::default());
        let queries: Vec<_> = ranked.queries().collect();
        assert_eq!(queries, vec!["second", "first"]);
        assert!(ranked.get("first").unwrap().is_empty());
    }

    #[test]
    fn test_is_score_sorted() {
        assert!(is_score_sorted(&merged()));
        assert!(!is_score_sorted(&vec![m(0.1, "a", &["A"]), m(0.2, "b", &["B"])]));
    }
}
