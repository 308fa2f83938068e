//! Context-budget packing.
//!
//! Retrieval providers hand back ranked [`Section`]s; this module fits
//! them into a model's token budget with a deterministic truncation
//! policy. The pruner never mutates the caller's sections and never
//! reorders beyond the single relevance-first pass.

mod prune;
mod section;

pub use prune::{EMBEDDING_CHUNK_TOKENS, METADATA_TOKEN_ESTIMATE, PruningConfig, prune_sections};
pub use section::{IGNORE_FOR_QA, Section, SectionKey};
