//! Agentic deep-search workflow.
//!
//! Decomposes a user query into sub-questions, answers each against its
//! own verified retrieval context, consolidates the evidence, and
//! streams an initial answer. When that answer misses the mark, a
//! refinement round extracts entities and terms from exploratory
//! documents, generates follow-up sub-questions, and streams a refined
//! answer over the enlarged context.
//!
//! # Architecture
//!
//! ```text
//! User query → DeepSearchAgent::run
//!   ├── exploratory search + decomposition
//!   ├── Fan-out → N concurrent SubQuestionBranches
//!   │   └── retrieve → verify (fan-out) → rerank → answer
//!   ├── consolidate context (cited first, backfill originals)
//!   ├── initial answer (streamed, level 0)
//!   ├── quality gate ──ok──▶ stream_stop
//!   └── refinement (level 1)
//!       └── extract entities/terms → follow-up branches → refined answer
//! ```
//!
//! All consumer-visible output flows through [`stream::AnswerStream`];
//! dropping it cancels the run.

pub mod config;
pub mod extraction;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod retrieval;
pub mod state;
pub mod stream;
pub mod subquestion;

pub use config::{GraphConfig, GraphConfigBuilder};
pub use message::{ChatMessage, Role};
pub use orchestrator::{DeepSearchAgent, QueryRequest};
pub use provider::{LlmProvider, TokenStream};
pub use retrieval::{RerankSettings, RetrievalProvider};
pub use state::{FollowUpSubQuestion, MainState, SubQuestionAnswerResult};
pub use stream::{AnswerPacket, AnswerStream};
