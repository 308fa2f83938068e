//! Retrieved passages and their prompt serializations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Metadata key marking a section as excluded from question answering.
///
/// Sections carrying this key (any non-empty value) are filtered out by
/// the pruner before budget accounting.
pub const IGNORE_FOR_QA: &str = "ignore_for_qa";

/// Identity of a section within a run: document plus chunk.
///
/// Dedup reducers and consolidation key on this pair; two sections with
/// the same key are the same passage regardless of which retrieval branch
/// produced them.
pub type SectionKey = (String, i64);

/// A retrieved, scored passage of source content.
///
/// Sections are immutable value objects once produced by retrieval; the
/// pruner clones before truncating so upstream results are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// Source document identifier.
    pub document_id: String,
    /// Chunk identifier within the document.
    pub chunk_id: i64,
    /// Combined passage text sent to the model.
    pub combined_content: String,
    /// Relevance score from the retrieval provider, when available.
    #[serde(default)]
    pub score: Option<f64>,
    /// Human-readable identifier (title, file name, ...).
    #[serde(default)]
    pub semantic_identifier: String,
    /// Source system type (e.g. `"web"`, `"notion"`, `"file"`).
    #[serde(default)]
    pub source_type: String,
    /// Last-updated timestamp in RFC 3339 form, when known.
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Arbitrary connector metadata, including [`IGNORE_FOR_QA`].
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Section {
    /// Creates a section with the minimum identifying fields.
    #[must_use]
    pub fn new(document_id: impl Into<String>, chunk_id: i64, content: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_id,
            combined_content: content.into(),
            score: None,
            semantic_identifier: String::new(),
            source_type: String::new(),
            updated_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Dedup key for this section.
    #[must_use]
    pub fn key(&self) -> SectionKey {
        (self.document_id.clone(), self.chunk_id)
    }

    /// Whether this section is flagged as not usable for QA.
    #[must_use]
    pub fn ignored_for_qa(&self) -> bool {
        self.metadata
            .get(IGNORE_FOR_QA)
            .is_some_and(|v| !v.is_empty())
    }

    /// Renders the citation-style context block for direct prompting.
    ///
    /// `ind` is the 1-based-looking document number shown to the model
    /// (passed 0-based, rendered +1) so answers can cite `[D3]`.
    #[must_use]
    pub fn context_block(&self, ind: usize) -> String {
        let mut block = format!("DOCUMENT {}: {}\n", ind + 1, self.semantic_identifier);
        if !self.source_type.is_empty() {
            block.push_str(&format!("Source: {}\n", self.source_type));
        }
        if let Some(updated_at) = &self.updated_at {
            block.push_str(&format!("Updated: {updated_at}\n"));
        }
        for (key, value) in &self.metadata {
            if key != IGNORE_FOR_QA {
                block.push_str(&format!("{key}: {value}\n"));
            }
        }
        block.push_str(&self.combined_content);
        block.push('\n');
        block
    }

    /// Renders the tool-call JSON document representation.
    ///
    /// Used when context is delivered via a tool message rather than
    /// inline prompt text. Slightly overestimates the pruning budget since
    /// the JSON framing is counted per section, but overlapping framing is
    /// not double-counted once sections are merged downstream.
    #[must_use]
    pub fn to_tool_document(&self, ind: usize) -> serde_json::Value {
        json!({
            "document": ind,
            "title": self.semantic_identifier,
            "content": self.combined_content,
            "source": self.source_type,
            "updated_at": self.updated_at,
            "metadata": self.metadata,
        })
    }
}
