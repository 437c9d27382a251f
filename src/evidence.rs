//! Evidence anchoring for model-quoted text.
//!
//! The text analyzers quote profile content verbatim as evidence. A quote
//! that cannot be traced back to the profile after normalization is treated
//! as hallucinated and the whole entry is rejected.

use std::collections::HashSet;

use crate::normalize::normalize;

/// Minimum word length considered when anchoring evidence.
const MIN_WORD_LEN: usize = 2;

/// Verifies that quoted evidence strings anchor to source text.
#[derive(Debug, Clone)]
pub struct EvidenceValidator {
    /// Fraction of unique evidence words that must occur in a target.
    match_fraction: f64,
    /// Absolute floor on the matched-word threshold.
    min_words: usize,
}

impl Default for EvidenceValidator {
    fn default() -> Self {
        Self {
            match_fraction: 0.4,
            min_words: 2,
        }
    }
}

impl EvidenceValidator {
    pub fn new(match_fraction: f64) -> Self {
        Self {
            match_fraction,
            ..Self::default()
        }
    }

    /// Check quoted strings against the target texts.
    ///
    /// Collects the unique whitespace-delimited words (length >= 2) across
    /// all quotes, normalizes them, and counts how many occur as substrings
    /// of any normalized target. Passes when the count reaches
    /// `max(min_words, ceil(match_fraction * unique_words))`, capped at the
    /// number of unique words.
    pub fn validate(&self, quotes: &[String], targets: &[&str]) -> bool {
        let normalized_targets: Vec<String> = targets
            .iter()
            .map(|t| normalize(t))
            .filter(|t| !t.is_empty())
            .collect();
        if normalized_targets.is_empty() {
            return false;
        }

        let words: HashSet<&str> = quotes
            .iter()
            .flat_map(|q| q.split_whitespace())
            .filter(|w| w.chars().count() >= MIN_WORD_LEN)
            .collect();
        if words.is_empty() {
            return false;
        }

        let normalized_words: HashSet<String> = words
            .iter()
            .map(|w| normalize(w))
            .filter(|w| !w.is_empty())
            .collect();

        let matched = normalized_words
            .iter()
            .filter(|w| normalized_targets.iter().any(|t| t.contains(w.as_str())))
            .count();

        let threshold = ((self.match_fraction * words.len() as f64).ceil() as usize)
            .max(self.min_words)
            .min(words.len());

        matched >= threshold
    }
}
