//! Graph configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.
//! One `GraphConfig` is built at startup and shared read-only across
//! request-scope executions.

use std::time::Duration;

use super::retrieval::RerankSettings;

/// Default maximum concurrent external calls per run.
const DEFAULT_MAX_CONCURRENCY: usize = 20;
/// Default per-call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default retry attempts beyond the first call.
const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default sections fetched per retrieval query.
const DEFAULT_RETRIEVAL_LIMIT: usize = 15;
/// Default maximum initial sub-questions per query.
const DEFAULT_MAX_SUB_QUESTIONS: usize = 3;
/// Default consolidated context size in documents.
const DEFAULT_MAX_ANSWER_CONTEXT_DOCS: usize = 15;
/// Default minimum original-question documents kept during consolidation.
const DEFAULT_MIN_ORIG_QUESTION_DOCS: usize = 3;
/// Exploratory documents sampled for entity/term extraction.
const DEFAULT_NUM_EXPLORATORY_DOCS: usize = 15;
/// Chat history longer than this many words is summarized first.
const DEFAULT_MAX_HISTORY_WORDS: usize = 2000;
/// Sections kept after reranking when only a rerank model is named.
const DEFAULT_NUM_RERANK: usize = 20;

/// Configuration for the orchestration graph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Model used for answer generation.
    pub primary_model: String,
    /// Model used for verification, grading, and extraction calls.
    pub fast_model: String,
    /// Per-external-call timeout.
    pub timeout: Duration,
    /// Retry attempts beyond the first call.
    pub max_retries: u32,
    /// Maximum concurrent external calls (verification fan-out,
    /// per-sub-question branches).
    pub max_concurrency: usize,
    /// Whether the refinement pass may run at all.
    pub allow_refinement: bool,
    /// Sections fetched per retrieval query.
    pub retrieval_limit: usize,
    /// Maximum initial sub-questions generated per query.
    pub max_sub_questions: usize,
    /// Consolidated answer context size in documents.
    pub max_answer_context_docs: usize,
    /// Minimum original-question documents backfilled during
    /// consolidation.
    pub min_orig_question_docs: usize,
    /// Exploratory documents sampled for entity/term extraction.
    pub num_exploratory_docs: usize,
    /// Word count above which chat history is summarized.
    pub max_history_words: usize,
    /// Cross-encoder reranking configuration.
    pub rerank: RerankSettings,
}

impl GraphConfig {
    /// Creates a new builder for `GraphConfig`.
    #[must_use]
    pub fn builder() -> GraphConfigBuilder {
        GraphConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder().from_env().build()
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`GraphConfig`].
#[derive(Debug, Clone, Default)]
pub struct GraphConfigBuilder {
    primary_model: Option<String>,
    fast_model: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    max_concurrency: Option<usize>,
    allow_refinement: Option<bool>,
    retrieval_limit: Option<usize>,
    max_sub_questions: Option<usize>,
    max_answer_context_docs: Option<usize>,
    min_orig_question_docs: Option<usize>,
    num_exploratory_docs: Option<usize>,
    max_history_words: Option<usize>,
    rerank: Option<RerankSettings>,
}

impl GraphConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.primary_model.is_none() {
            self.primary_model = std::env::var("DEEPQA_PRIMARY_MODEL").ok();
        }
        if self.fast_model.is_none() {
            self.fast_model = std::env::var("DEEPQA_FAST_MODEL").ok();
        }
        if self.timeout.is_none() {
            self.timeout = std::env::var("DEEPQA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
        }
        if self.max_retries.is_none() {
            self.max_retries = std::env::var("DEEPQA_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_concurrency.is_none() {
            self.max_concurrency = std::env::var("DEEPQA_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.allow_refinement.is_none() {
            self.allow_refinement = std::env::var("DEEPQA_ALLOW_REFINEMENT")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.retrieval_limit.is_none() {
            self.retrieval_limit = std::env::var("DEEPQA_RETRIEVAL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_sub_questions.is_none() {
            self.max_sub_questions = std::env::var("DEEPQA_MAX_SUB_QUESTIONS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_answer_context_docs.is_none() {
            self.max_answer_context_docs = std::env::var("DEEPQA_MAX_ANSWER_CONTEXT_DOCS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.min_orig_question_docs.is_none() {
            self.min_orig_question_docs = std::env::var("DEEPQA_MIN_ORIG_QUESTION_DOCS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.num_exploratory_docs.is_none() {
            self.num_exploratory_docs = std::env::var("DEEPQA_NUM_EXPLORATORY_DOCS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_history_words.is_none() {
            self.max_history_words = std::env::var("DEEPQA_MAX_HISTORY_WORDS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.rerank.is_none() {
            let model = std::env::var("DEEPQA_RERANK_MODEL").ok();
            let num = std::env::var("DEEPQA_NUM_RERANK")
                .ok()
                .and_then(|v| v.parse().ok());
            if model.is_some() || num.is_some() {
                self.rerank = Some(RerankSettings {
                    rerank_model_name: model,
                    num_rerank: num.unwrap_or(DEFAULT_NUM_RERANK),
                });
            }
        }
        self
    }

    /// Sets the primary (answer generation) model.
    #[must_use]
    pub fn primary_model(mut self, model: impl Into<String>) -> Self {
        self.primary_model = Some(model.into());
        self
    }

    /// Sets the fast (verification/grading) model.
    #[must_use]
    pub fn fast_model(mut self, model: impl Into<String>) -> Self {
        self.fast_model = Some(model.into());
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets the max retries.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Sets the maximum concurrency.
    #[must_use]
    pub const fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Enables or disables the refinement pass.
    #[must_use]
    pub const fn allow_refinement(mut self, allow: bool) -> Self {
        self.allow_refinement = Some(allow);
        self
    }

    /// Sets the per-query retrieval limit.
    #[must_use]
    pub const fn retrieval_limit(mut self, n: usize) -> Self {
        self.retrieval_limit = Some(n);
        self
    }

    /// Sets the maximum initial sub-questions.
    #[must_use]
    pub const fn max_sub_questions(mut self, n: usize) -> Self {
        self.max_sub_questions = Some(n);
        self
    }

    /// Sets the consolidated context size in documents.
    #[must_use]
    pub const fn max_answer_context_docs(mut self, n: usize) -> Self {
        self.max_answer_context_docs = Some(n);
        self
    }

    /// Sets the minimum original-question documents kept during
    /// consolidation.
    #[must_use]
    pub const fn min_orig_question_docs(mut self, n: usize) -> Self {
        self.min_orig_question_docs = Some(n);
        self
    }

    /// Sets the exploratory-document sample size for extraction.
    #[must_use]
    pub const fn num_exploratory_docs(mut self, n: usize) -> Self {
        self.num_exploratory_docs = Some(n);
        self
    }

    /// Sets the history summarization word threshold.
    #[must_use]
    pub const fn max_history_words(mut self, n: usize) -> Self {
        self.max_history_words = Some(n);
        self
    }

    /// Sets the rerank settings.
    #[must_use]
    pub fn rerank(mut self, settings: RerankSettings) -> Self {
        self.rerank = Some(settings);
        self
    }

    /// Builds the [`GraphConfig`].
    #[must_use]
    pub fn build(self) -> GraphConfig {
        GraphConfig {
            primary_model: self
                .primary_model
                .unwrap_or_else(|| "gpt-4o-2024-11-20".to_string()),
            fast_model: self
                .fast_model
                .unwrap_or_else(|| "gpt-4o-mini-2024-07-18".to_string()),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            allow_refinement: self.allow_refinement.unwrap_or(true),
            retrieval_limit: self.retrieval_limit.unwrap_or(DEFAULT_RETRIEVAL_LIMIT),
            max_sub_questions: self.max_sub_questions.unwrap_or(DEFAULT_MAX_SUB_QUESTIONS),
            max_answer_context_docs: self
                .max_answer_context_docs
                .unwrap_or(DEFAULT_MAX_ANSWER_CONTEXT_DOCS),
            min_orig_question_docs: self
                .min_orig_question_docs
                .unwrap_or(DEFAULT_MIN_ORIG_QUESTION_DOCS),
            num_exploratory_docs: self
                .num_exploratory_docs
                .unwrap_or(DEFAULT_NUM_EXPLORATORY_DOCS),
            max_history_words: self.max_history_words.unwrap_or(DEFAULT_MAX_HISTORY_WORDS),
            rerank: self.rerank.unwrap_or_default(),
        }
    }
}
