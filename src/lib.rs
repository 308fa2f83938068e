//! Retrieval-augmented deep-search question answering.
//!
//! Two halves make up the crate:
//!
//! - [`context`]: token-budget packing of retrieved document sections.
//!   A word-boundary [`tokenizer`] estimates sizes and the pruner cuts
//!   a ranked section list to the tightest applicable limit, trimming
//!   the section at the cut point rather than dropping it.
//! - [`agent`]: the orchestration graph. Queries are decomposed into
//!   sub-questions answered concurrently against verified retrieval
//!   context, consolidated, and answered in up to two streamed rounds
//!   (initial and refined).
//!
//! Providers are pluggable: implement [`agent::LlmProvider`] and
//! [`agent::RetrievalProvider`] for your model API and document index,
//! then drive a run:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use deepqa_rs::agent::{DeepSearchAgent, GraphConfig, QueryRequest};
//! # fn demo(
//! #     primary: Arc<dyn deepqa_rs::agent::LlmProvider>,
//! #     fast: Arc<dyn deepqa_rs::agent::LlmProvider>,
//! #     retrieval: Arc<dyn deepqa_rs::agent::RetrievalProvider>,
//! # ) {
//! let agent = DeepSearchAgent::new(primary, fast, retrieval, GraphConfig::from_env());
//! let stream = agent.run(QueryRequest::new("How does section pruning work?"));
//! # let _ = stream;
//! # }
//! ```

pub mod agent;
pub mod context;
pub mod error;
pub mod tokenizer;

pub use error::{AgentError, PruneError};
