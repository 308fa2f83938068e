//! Error types for the QA core.
//!
//! Two taxonomies cover the crate: [`PruneError`] for context-budget
//! packing (configuration problems plus the one user-correctable
//! condition) and [`AgentError`] for orchestration-graph execution.

use thiserror::Error;

/// Errors raised while fitting retrieved sections into a token budget.
#[derive(Debug, Error)]
pub enum PruneError {
    /// No limit field resolved to a positive token count.
    ///
    /// Fatal to the request and never retried: the caller must supply at
    /// least one of `max_chunks`, `max_window_percentage`, `max_tokens`,
    /// or a model-derived document-token limit.
    #[error(
        "no token limit could be resolved; set max_chunks, max_window_percentage, \
         max_tokens, or provide a model document-token limit"
    )]
    NoTokenLimit,

    /// A relevance list was supplied whose length does not match the
    /// section list.
    #[error("relevance list length {relevance_len} does not match section count {section_count}")]
    RelevanceLengthMismatch {
        /// Number of entries in the relevance list.
        relevance_len: usize,
        /// Number of sections being pruned.
        section_count: usize,
    },

    /// Manually selected documents exceed the context window.
    ///
    /// User-correctable: surfaced verbatim as a 4xx-equivalent condition,
    /// never retried. Only the final selected document may be truncated;
    /// anything beyond that means whole documents would be silently
    /// dropped, which the manual-selection flow does not allow.
    #[error("LLM context window exceeded. Please de-select some documents or shorten your query.")]
    ContextWindowExceeded,
}

/// Errors raised by the orchestration graph and its external collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An LLM provider call failed.
    #[error("LLM provider error: {message}")]
    Provider {
        /// Provider error details.
        message: String,
    },

    /// A retrieval provider call failed.
    #[error("retrieval provider error: {message}")]
    Retrieval {
        /// Provider error details.
        message: String,
    },

    /// An external call exceeded its per-call timeout.
    #[error("call timed out after {seconds}s")]
    Timeout {
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// The model's output could not be parsed into the expected structure.
    #[error("response parse error: {message}")]
    ResponseParse {
        /// Parse failure details.
        message: String,
        /// The raw response content, for diagnostics.
        content: String,
    },

    /// A graph-level coordination failure (empty input, join failure, ...).
    #[error("orchestration error: {message}")]
    Orchestration {
        /// Failure details.
        message: String,
    },

    /// The consumer detached and the run was cancelled.
    ///
    /// Not an error condition for the consumer; used internally so nodes
    /// can unwind promptly once the output stream is closed.
    #[error("query run cancelled by consumer")]
    Cancelled,

    /// Pruning failed while building an answer context.
    #[error(transparent)]
    Prune(#[from] PruneError),
}
