//! Token counting and trimming for budget arithmetic.
//!
//! The pruner and prompt builders need a deterministic way to measure text
//! against a model's context window and to cut text at token boundaries.
//! This adapter segments on unicode word bounds: every word-bound segment
//! that is not pure whitespace counts as one token. That keeps counting
//! pure and reproducible while staying close enough to real LLM
//! vocabularies for budget purposes.

use unicode_segmentation::UnicodeSegmentation;

/// Deterministic tokenizer for a specific model family.
///
/// Pure and stateless: the same input always yields the same count, and
/// trimming is token-boundary-accurate (never mid-word).
#[derive(Debug, Clone)]
pub struct Tokenizer {
    model: String,
}

impl Tokenizer {
    /// Creates a tokenizer for the given model identifier.
    ///
    /// The identifier is carried for logging and future vocabulary
    /// selection; segmentation itself is model-independent.
    #[must_use]
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    /// Model identifier this tokenizer was built for.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Counts tokens in `text`.
    ///
    /// Whitespace-only segments are not tokens; punctuation and words are.
    #[must_use]
    pub fn count(&self, text: &str) -> usize {
        text.split_word_bounds()
            .filter(|seg| !seg.trim().is_empty())
            .count()
    }

    /// Trims `text` to at most `desired_token_length` tokens.
    ///
    /// The cut happens exactly at the end of the last kept token, so
    /// trailing whitespace after it is dropped with the tail. Idempotent:
    /// text already within the budget is returned unchanged, including its
    /// original trailing whitespace.
    #[must_use]
    pub fn trim(&self, text: &str, desired_token_length: usize) -> String {
        if desired_token_length == 0 {
            return String::new();
        }

        let mut kept = 0usize;
        let mut end = 0usize;
        for (offset, seg) in text.split_word_bound_indices() {
            if seg.trim().is_empty() {
                continue;
            }
            kept += 1;
            end = offset + seg.len();
            if kept == desired_token_length {
                break;
            }
        }

        if kept < desired_token_length {
            // Already within budget.
            return text.to_string();
        }

        // One non-whitespace token may remain past `end`; if none does,
        // the text fit exactly and is returned whole.
        if text[end..].split_word_bounds().all(|s| s.trim().is_empty()) {
            return text.to_string();
        }

        text[..end].to_string()
    }
}
