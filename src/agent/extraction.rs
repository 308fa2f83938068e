//! Entity/relationship/term extraction from exploratory documents.
//!
//! The refinement pass asks the fast model for a structured JSON object
//! describing the entities, relationships, and terms in a bounded sample
//! of exploratory documents. Extraction failures are never fatal: a
//! malformed response degrades to an empty extraction and the run
//! continues.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;

/// A named entity found in the exploratory documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    /// Entity name.
    #[serde(default)]
    pub entity_name: String,
    /// Entity type (person, product, concept, ...).
    #[serde(default)]
    pub entity_type: String,
}

/// A relationship between two extracted entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship name.
    #[serde(default)]
    pub relationship_name: String,
    /// Relationship type.
    #[serde(default)]
    pub relationship_type: String,
    /// Entities the relationship connects.
    #[serde(default)]
    pub relationship_entities: Vec<String>,
}

/// A domain term worth expanding follow-up questions around.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Term {
    /// The term itself.
    #[serde(default)]
    pub term_name: String,
    /// Term type.
    #[serde(default)]
    pub term_type: String,
    /// Terms with similar meaning.
    #[serde(default)]
    pub term_similar_to: Vec<String>,
}

/// Structured output of the extraction node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRelationshipTermExtraction {
    /// Extracted entities.
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Extracted relationships.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Extracted terms.
    #[serde(default)]
    pub terms: Vec<Term>,
}

impl EntityRelationshipTermExtraction {
    /// Whether nothing was extracted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.terms.is_empty()
    }
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"```json\n|\n```|```").unwrap();
    re
});

/// Parses the model's extraction response, tolerating markdown fences.
///
/// Any parse failure degrades to an empty extraction; the run must not
/// abort because a fast model produced malformed JSON.
#[must_use]
pub fn parse_extraction(content: &str) -> EntityRelationshipTermExtraction {
    let cleaned = CODE_FENCE.replace_all(content.trim(), "");
    match serde_json::from_str(&cleaned) {
        Ok(extraction) => extraction,
        Err(err) => {
            error!(error = %err, "failed to parse LLM response as JSON in entity-term extraction");
            EntityRelationshipTermExtraction::default()
        }
    }
}
