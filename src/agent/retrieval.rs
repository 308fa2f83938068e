//! Black-box retrieval provider seam.
//!
//! The search and rerank engines live outside the core; this trait is the
//! whole contract. Provider calls are assumed idempotent and retry-safe,
//! with retry policy applied at the call site like LLM calls.

use async_trait::async_trait;

use crate::context::Section;
use crate::error::AgentError;

/// Cross-encoder reranking configuration.
///
/// Reranking runs only when a model name is set and `num_rerank` is
/// positive; otherwise verified sections pass through unranked.
#[derive(Debug, Clone, Default)]
pub struct RerankSettings {
    /// Rerank model identifier, when reranking is configured.
    pub rerank_model_name: Option<String>,
    /// Maximum sections to keep after reranking.
    pub num_rerank: usize,
}

impl RerankSettings {
    /// Whether reranking should run at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.rerank_model_name.is_some() && self.num_rerank > 0
    }
}

/// Trait for external retrieval backends (vector/keyword search engines).
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    /// Provider name, for logging.
    fn name(&self) -> &'static str;

    /// Runs a search and returns ranked sections, best first.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Retrieval`] on backend failures.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Section>, AgentError>;

    /// Reorders `sections` by relevance to `query` with a cross-encoder
    /// model, returning at most `num_rerank` sections.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Retrieval`] on backend failures.
    async fn rerank(
        &self,
        query: &str,
        sections: Vec<Section>,
        num_rerank: usize,
    ) -> Result<Vec<Section>, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rerank_settings_gate() {
        assert!(!RerankSettings::default().is_enabled());
        assert!(
            !RerankSettings {
                rerank_model_name: Some("cross-encoder".to_string()),
                num_rerank: 0,
            }
            .is_enabled()
        );
        assert!(
            RerankSettings {
                rerank_model_name: Some("cross-encoder".to_string()),
                num_rerank: 20,
            }
            .is_enabled()
        );
    }
}
