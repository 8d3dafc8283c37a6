//! K-way fusion of per-index results
//!
//! Each input list is already sorted by descending score, so a cursor per
//! list is enough: repeatedly take the best head. Ties go to the list that
//! comes first in the argument order, which keeps the output a pure function
//! of the (ordered) inputs.

use crate::types::{EmbeddingsMatch, EmbeddingsResult, SearchVarsResult};

/// Merge score-sorted lists into one score-sorted list. No deduplication.
pub fn merge_lists(lists: &[&EmbeddingsResult]) -> EmbeddingsResult {
    let total = lists.iter().map(|l| l.len()).sum();
    let mut merged: Vec<EmbeddingsMatch> = Vec::with_capacity(total);
    let mut cursors = vec![0usize; lists.len()];

    loop {
        let mut best: Option<(usize, f64)> = None;
        for (list_idx, list) in lists.iter().enumerate() {
            let Some(candidate) = list.get(cursors[list_idx]) else {
                continue;
            };
            // Strictly greater: an equal score never displaces an earlier list
            if best.map_or(true, |(_, score)| candidate.score > score) {
                best = Some((list_idx, candidate.score));
            }
        }

        let Some((list_idx, _)) = best else {
            break;
        };
        merged.push(lists[list_idx][cursors[list_idx]].clone());
        cursors[list_idx] += 1;
    }

    merged
}

/// Merge the results of several indexes query by query. Queries keep the
/// order in which they first appear across `results`.
pub fn merge_search_results(results: &[SearchVarsResult]) -> SearchVarsResult {
    let mut merged = SearchVarsResult::new();

    for result in results {
        for query in result.queries() {
            if merged.contains(query) {
                continue;
            }
            let lists: Vec<&EmbeddingsResult> =
                results.iter().filter_map(|r| r.get(query)).collect();
            merged.insert(query, merge_lists(&lists));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(score: f64, sentence: &str, var: &str) -> EmbeddingsMatch {
        EmbeddingsMatch::new(sentence, score, vec![var.to_string()])
    }

    fn poverty_inputs() -> Vec<SearchVarsResult> {
        let first: SearchVarsResult = [(
            "poverty",
            vec![
                m(0.85, "poverty", "Count_Person_BelowPovertyLevel"),
                m(0.75, "families in poverty", "Count_Family_BelowPovertyLevel"),
                m(0.70, "above poverty", "WHO_AbovePoverty"),
            ],
        )]
        .into_iter()
        .collect();
        let second: SearchVarsResult = [(
            "poverty",
            vec![
                m(0.90, "below poverty", "Count_Person_BelowPovertyLevel"),
                m(0.80, "above poverty", "Count_AbovePovertyLevel"),
                m(0.70, "poor households", "Household_BelowPovertyLevel"),
            ],
        )]
        .into_iter()
        .collect();
        vec![first, second]
    }

    #[test]
    fn test_tie_goes_to_earlier_list() {
        let merged = merge_search_results(&poverty_inputs());
        let result = merged.get("poverty").unwrap();

        let scores: Vec<f64> = result.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![0.90, 0.85, 0.80, 0.75, 0.70, 0.70]);
        assert_eq!(result[4].sentence, "above poverty");
        assert_eq!(result[4].variables, vec!["WHO_AbovePoverty"]);
        assert_eq!(result[5].sentence, "poor households");
    }

    #[test]
    fn test_merge_is_deterministic_and_complete() {
        let inputs = poverty_inputs();
        let a = merge_search_results(&inputs);
        let b = merge_search_results(&inputs);
        assert_eq!(a, b);

        let merged = a.get("poverty").unwrap();
        assert_eq!(merged.len(), 6);
        assert!(merged.windows(2).all(|w| w[0].score >= w[1].score));

        let mut expected: Vec<_> = inputs
            .iter()
            .flat_map(|r| r.get("poverty").unwrap().iter().map(|m| m.sentence.clone()))
            .collect();
        let mut actual: Vec<_> = merged.iter().map(|m| m.sentence.clone()).collect();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_merge_uneven_and_empty_lists() {
        let a = vec![m(0.5, "a", "A")];
        let b: EmbeddingsResult = Vec::new();
        let c = vec![m(0.9, "c1", "C"), m(0.4, "c2", "C"), m(0.1, "c3", "C")];

        let merged = merge_lists(&[&a, &b, &c]);
        let sentences: Vec<_> = merged.iter().map(|m| m.sentence.as_str()).collect();
        assert_eq!(sentences, vec!["c1", "a", "c2", "c3"]);

        assert!(merge_lists(&[]).is_empty());
    }

    #[test]
    fn test_queries_keep_first_seen_order() {
        let first: SearchVarsResult = [("b", vec![m(0.1, "x", "X")])].into_iter().collect();
        let second: SearchVarsResult = [("a", vec![m(0.2, "y", "Y")]), ("b", Vec::new())]
            .into_iter()
            .collect();

        let merged = merge_search_results(&[first, second]);
        let queries: Vec<_> = merged.queries().collect();
        assert_eq!(queries, vec!["b", "a"]);
        assert_eq!(merged.get("b").unwrap().len(), 1);
    }
}
