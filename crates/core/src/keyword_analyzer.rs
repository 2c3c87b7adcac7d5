//! KeywordAnalyzer — per-file TF-IDF keyword extraction, spec.md §4.4.
//!
//! `TermDocFreq` and its Laplace-smoothed IDF are carried over directly from
//! the teacher's `crates/core/src/types.rs`, generalized from a
//! search-ranking auxiliary into the analyzer's own corpus-wide document
//! frequency table.

use crate::model::KeywordScore;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Per-term document frequency table for IDF-weighted keyword scoring
/// (spec.md §4.4). Grounded in the teacher's `TermDocFreq`.
#[derive(Default)]
pub struct TermDocFreq {
    pub total_docs: usize,
    pub freq: HashMap<String, usize>,
}

impl TermDocFreq {
    pub fn new() -> Self {
        Self { total_docs: 0, freq: HashMap::new() }
    }

    /// IDF with Laplace smoothing: ln((N+1)/(df+1)) + 1. Unknown terms
    /// default to df=total_docs (IDF ~1.0).
    pub fn idf(&self, term: &str) -> f64 {
        let df = self.freq.get(term).copied().unwrap_or(self.total_docs);
        (((self.total_docs as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0).max(1.0)
    }

    pub fn observe_document(&mut self, terms: &std::collections::HashSet<String>) {
        self.total_docs += 1;
        for term in terms {
            *self.freq.entry(term.clone()).or_insert(0) += 1;
        }
    }

    /// Fraction growth in `total_docs` since `baseline`, used to decide
    /// whether the IDF table needs a full rebuild (spec.md §4.4).
    pub fn growth_since(&self, baseline: usize) -> f64 {
        if baseline == 0 {
            return 1.0;
        }
        (self.total_docs.saturating_sub(baseline)) as f64 / baseline as f64
    }
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").unwrap())
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "has", "was", "were", "this",
    "that", "with", "from", "have", "will", "would", "could", "should", "their", "there", "then",
    "than", "into", "over", "such", "also", "each", "more", "some", "what", "when", "where",
    "which", "while", "about", "after", "before", "other", "these", "those", "being",
];

/// Tokenize into lowercased terms, splitting `snake_case` and `camelCase`
/// identifiers into subwords so keyword extraction sees natural-language
/// fragments of code identifiers too.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in word_pattern().find_iter(text) {
        for part in split_identifier(m.as_str()) {
            let lower = part.to_lowercase();
            if lower.len() >= 3 && !STOPWORDS.contains(&lower.as_str()) {
                out.push(lower);
            }
        }
    }
    out
}

fn split_identifier(word: &str) -> Vec<String> {
    if word.contains('_') {
        return word.split('_').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect();
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in word.chars() {
        if c.is_uppercase() && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.len() <= 1 {
        vec![word.to_string()]
    } else {
        parts
    }
}

/// Compute the top-`top_k` TF-IDF keywords for one file's full text, given
/// the corpus-wide document frequency table (spec.md §4.4).
pub fn analyze(text: &str, doc_freq: &TermDocFreq, top_k: usize) -> Vec<KeywordScore> {
    let terms = tokenize(text);
    if terms.is_empty() {
        return Vec::new();
    }

    let mut term_counts: HashMap<String, usize> = HashMap::new();
    for t in &terms {
        *term_counts.entry(t.clone()).or_insert(0) += 1;
    }
    let total_terms = terms.len() as f64;

    let mut scored: Vec<KeywordScore> = term_counts
        .into_iter()
        .map(|(term, count)| {
            let tf = count as f64 / total_terms;
            let score = tf * doc_freq.idf(&term);
            KeywordScore { keyword: term, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

/// Distinct terms appearing in one file's text, used to update the
/// corpus-wide document frequency table (spec.md §4.4).
pub fn distinct_terms(text: &str) -> std::collections::HashSet<String> {
    tokenize(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idf_of_ubiquitous_term_is_near_one() {
        let mut df = TermDocFreq::new();
        for _ in 0..100 {
            df.observe_document(&["common".to_string()].into_iter().collect());
        }
        assert!((df.idf("common") - 1.0).abs() < 0.1);
    }

    #[test]
    fn idf_of_rare_term_exceeds_common_term() {
        let mut df = TermDocFreq::new();
        for i in 0..100 {
            let mut terms = std::collections::HashSet::new();
            terms.insert("common".to_string());
            if i == 0 {
                terms.insert("rare".to_string());
            }
            df.observe_document(&terms);
        }
        assert!(df.idf("rare") > df.idf("common"));
    }

    #[test]
    fn analyze_ranks_distinctive_terms_above_stopwords() {
        let mut df = TermDocFreq::new();
        df.observe_document(&distinct_terms("quantum entanglement experiment"));
        let keywords = analyze("the quantum entanglement experiment succeeded", &df, 5);
        assert!(keywords.iter().any(|k| k.keyword == "quantum"));
        assert!(!keywords.iter().any(|k| k.keyword == "the"));
    }

    #[test]
    fn split_identifier_handles_snake_and_camel_case() {
        assert_eq!(split_identifier("snake_case_name"), vec!["snake", "case", "name"]);
        assert_eq!(split_identifier("camelCaseName"), vec!["camel", "Case", "Name"]);
    }
}
