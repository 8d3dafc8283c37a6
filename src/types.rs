//! Core data model shared by stores, merge, rank and rerank

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Separator between variable ids packed into one stored row
pub const ID_SEPARATOR: char = ';';

/// Reserved prefix of topic ids
pub const TOPIC_PREFIX: &str = "dc/topic/";

/// Split a stored id field into individual variable ids
pub fn split_ids(raw: &str) -> Vec<String> {
    raw.split(ID_SEPARATOR)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_topic(id: &str) -> bool {
    id.starts_with(TOPIC_PREFIX)
}

/// One retrieved hit
#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
pub struct EmbeddingsMatch {
    pub sentence: String,
    pub score: f64,
    pub variables: Vec<String>,
}

impl EmbeddingsMatch {
    pub fn new(sentence: impl Into<String>, score: f64, variables: Vec<String>) -> Self {
        Self {
            sentence: sentence.into(),
            score,
            variables,
        }
    }
}

/// Matches for one query, sorted by descending score
pub type EmbeddingsResult = Vec<EmbeddingsMatch>;

/// Query-keyed map that keeps insertion order and unique keys.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMap<T> {
    entries: Vec<(String, T)>,
    positions: HashMap<String, usize>,
}

impl<T> Default for QueryMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<T> QueryMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `query`. A replaced key keeps its
    /// original position.
    pub fn insert(&mut self, query: impl Into<String>, value: T) -> Option<T> {
        let query = query.into();
        if let Some(&pos) = self.positions.get(&query) {
            return Some(std::mem::replace(&mut self.entries[pos].1, value));
        }
        self.positions.insert(query.clone(), self.entries.len());
        self.entries.push((query, value));
        None
    }

    pub fn get(&self, query: &str) -> Option<&T> {
        self.positions.get(query).map(|&pos| &self.entries[pos].1)
    }

    pub fn contains(&self, query: &str) -> bool {
        self.positions.contains_key(query)
    }

    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(q, _)| q.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(q, v)| (q.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> IntoIterator for QueryMap<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T, K: Into<String>> FromIterator<(K, T)> for QueryMap<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut map = QueryMap::new();
        for (query, value) in iter {
            map.insert(query, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for QueryMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (query, value) in &self.entries {
            map.serialize_entry(query, value)?;
        }
        map.end()
    }
}

/// Per-query store results
pub type SearchVarsResult = QueryMap<EmbeddingsResult>;

/// One evidence sentence for a variable
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SentenceScore {
    pub sentence: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

/// Ranked, de-duplicated variable candidates for one query
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct VarCandidates {
    pub variables: Vec<String>,
    /// Parallel to `variables`
    pub scores: Vec<f64>,
    pub evidence: BTreeMap<String, Vec<SentenceScore>>,
}

impl VarCandidates {
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn score_of(&self, variable: &str) -> Option<f64> {
        self.variables
            .iter()
            .position(|v| v == variable)
            .map(|i| self.scores[i])
    }
}

/// Final candidates keyed by query
pub type QueryCandidates = QueryMap<VarCandidates>;
