//! Per-sub-question branch: retrieve, verify, rerank, answer.
//!
//! One branch runs end to end for each sub-question and always produces
//! a [`SubQuestionAnswerResult`]. Branch failures degrade to an
//! unanswered result so one bad sub-question never aborts the parent
//! run; only consumer cancellation propagates out.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::config::GraphConfig;
use super::message::user_message;
use super::metrics::compute_fit_stats;
use super::prompt::{
    MAX_PROMPT_TOKENS, SUB_ANSWER_CHECK_PROMPT, SUB_ANSWER_PROMPT, VERIFIER_PROMPT, format_docs,
    is_real_answer, trim_prompt_piece,
};
use super::provider::{
    LlmProvider, invoke_with_retries, next_with_timeout, open_stream_with_timeout,
};
use super::retrieval::RetrievalProvider;
use super::state::{SubQuestionAnswerResult, format_question_id};
use super::stream::{AnswerPacket, EventEmitter};
use crate::context::Section;
use crate::error::AgentError;
use crate::tokenizer::Tokenizer;

/// Shared handles one sub-question branch runs against.
///
/// Cheap to clone; every field is behind an [`Arc`] or already clonable,
/// so the orchestrator hands one clone to each spawned branch.
#[derive(Clone)]
pub struct SubQuestionBranch {
    /// Model used to synthesize the sub-answer.
    pub primary: Arc<dyn LlmProvider>,
    /// Model used for relevance verification and the answer self-check.
    pub fast: Arc<dyn LlmProvider>,
    /// Document retrieval backend.
    pub retrieval: Arc<dyn RetrievalProvider>,
    /// Tokenizer matching the primary model.
    pub tokenizer: Arc<Tokenizer>,
    /// Shared run configuration.
    pub config: Arc<GraphConfig>,
    /// Event channel back to the consumer.
    pub emitter: EventEmitter,
}

/// A branch's verified context plus its answer result.
pub struct BranchOutcome {
    /// The answer result, possibly unanswered on degradation.
    pub result: SubQuestionAnswerResult,
    /// Everything retrieval returned, before verification.
    pub retrieved_sections: Vec<Section>,
}

impl SubQuestionBranch {
    /// Runs the branch for one sub-question.
    ///
    /// # Errors
    ///
    /// Only [`AgentError::Cancelled`]; every other failure degrades to an
    /// unanswered [`SubQuestionAnswerResult`].
    pub async fn run(
        &self,
        original_question: &str,
        question: &str,
        level: u32,
        num: u32,
    ) -> Result<BranchOutcome, AgentError> {
        let question_id = format_question_id(level, num);

        // Query expansion is currently the identity, but the emitted
        // sub_query packets keep the wire contract stable for when it
        // is not.
        self.emitter
            .emit(AnswerPacket::SubQueryPiece {
                sub_query: question.to_string(),
                level,
                level_question_num: num,
                query_id: 0,
            })
            .await?;

        let retrieved = match self
            .retrieval
            .search(question, self.config.retrieval_limit)
            .await
        {
            Ok(sections) => sections,
            Err(err) => {
                warn!(question_id, error = %err, "retrieval failed; branch degrades to unanswered");
                return Ok(BranchOutcome {
                    result: SubQuestionAnswerResult::unanswered(
                        question_id,
                        question.to_string(),
                    ),
                    retrieved_sections: Vec::new(),
                });
            }
        };

        let relevance_list = self.verify_sections(question, &retrieved).await?;
        let mut verified: Vec<Section> = retrieved
            .iter()
            .zip(&relevance_list)
            .filter_map(|(section, &relevant)| relevant.then(|| section.clone()))
            .collect();

        verified = self.rerank_sections(question, verified).await;
        let fit = compute_fit_stats(&retrieved, &verified);
        debug!(
            question_id,
            verified = fit.verified_count,
            rejected = fit.rejected_count,
            "verification fit"
        );

        self.emitter
            .emit(AnswerPacket::ToolResponse {
                id: "sub_question_retrieval".to_string(),
                response: serde_json::Value::Array(
                    verified
                        .iter()
                        .enumerate()
                        .map(|(ind, s)| s.to_tool_document(ind))
                        .collect(),
                ),
                level,
                level_question_num: num,
            })
            .await?;

        let answer = self
            .stream_sub_answer(original_question, question, &verified, level, num)
            .await?;

        let verified_high_quality = match &answer {
            Some(text) if is_real_answer(text) => self.check_answer(question, text).await,
            _ => false,
        };

        let result = SubQuestionAnswerResult {
            question_id,
            question: question.to_string(),
            answer: answer.unwrap_or_default(),
            verified_high_quality,
            verified_sections: verified,
            relevance_list,
        };
        Ok(BranchOutcome {
            result,
            retrieved_sections: retrieved,
        })
    }

    /// Fans out one yes/no relevance check per retrieved section.
    ///
    /// Verdicts come back aligned with the input order regardless of
    /// completion order. A failed check counts as not relevant. Each
    /// task races its work against the run's cancellation token, so a
    /// detached consumer leaves no verification calls running.
    async fn verify_sections(
        &self,
        question: &str,
        sections: &[Section],
    ) -> Result<Vec<bool>, AgentError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let token = self.emitter.cancellation_token();
        let mut handles = Vec::with_capacity(sections.len());

        for (ind, section) in sections.iter().enumerate() {
            let fast = Arc::clone(&self.fast);
            let config = Arc::clone(&self.config);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let prompt = VERIFIER_PROMPT
                .replace("{question}", question)
                .replace(
                    "{document}",
                    &trim_prompt_piece(
                        &self.tokenizer,
                        MAX_PROMPT_TOKENS,
                        &section.combined_content,
                        question,
                    ),
                );
            handles.push(tokio::spawn(async move {
                let check = async {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return false;
                    };
                    let messages = [user_message(&prompt)];
                    match invoke_with_retries(
                        "verify_document",
                        config.timeout,
                        config.max_retries,
                        || fast.invoke(&messages),
                    )
                    .await
                    {
                        Ok(response) => response.to_lowercase().contains("yes"),
                        Err(err) => {
                            warn!(section_ind = ind, error = %err, "verification call failed");
                            false
                        }
                    }
                };
                tokio::select! {
                    () = token.cancelled() => false,
                    verdict = check => verdict,
                }
            }));
        }

        let mut verdicts = Vec::with_capacity(handles.len());
        for handle in handles {
            if self.emitter.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            verdicts.push(handle.await.unwrap_or(false));
        }
        Ok(verdicts)
    }

    /// Reranks the verified sections when a rerank model is configured.
    ///
    /// No configuration, or a rerank failure, passes the verified set
    /// through untouched in retrieval order.
    async fn rerank_sections(&self, question: &str, verified: Vec<Section>) -> Vec<Section> {
        if !self.config.rerank.is_enabled() {
            warn!("no rerank settings configured; keeping retrieval order");
            return verified;
        }
        match self
            .retrieval
            .rerank(question, verified.clone(), self.config.rerank.num_rerank)
            .await
        {
            Ok(reranked) => reranked,
            Err(err) => {
                warn!(error = %err, "rerank failed; keeping retrieval order");
                verified
            }
        }
    }

    /// Streams the sub-answer, returning `None` on degraded failure.
    async fn stream_sub_answer(
        &self,
        original_question: &str,
        question: &str,
        verified: &[Section],
        level: u32,
        num: u32,
    ) -> Result<Option<String>, AgentError> {
        let context = trim_prompt_piece(
            &self.tokenizer,
            MAX_PROMPT_TOKENS,
            &format_docs(verified),
            question,
        );
        let prompt = SUB_ANSWER_PROMPT
            .replace("{original_question}", original_question)
            .replace("{question}", question)
            .replace("{context}", &context);
        let messages = [user_message(&prompt)];

        let mut stream = match open_stream_with_timeout(
            "sub_answer",
            self.config.timeout,
            self.primary.as_ref(),
            &messages,
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "sub-answer stream failed to open");
                return Ok(None);
            }
        };

        let mut answer = String::new();
        loop {
            match next_with_timeout(&mut stream, self.config.timeout).await {
                Ok(Some(text)) => {
                    answer.push_str(&text);
                    self.emitter
                        .emit(AnswerPacket::AnswerPiece {
                            answer_piece: text,
                            level,
                            level_question_num: num,
                        })
                        .await?;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "sub-answer stream broke mid-generation");
                    return Ok(None);
                }
            }
        }
        Ok(Some(answer))
    }

    /// Asks the fast model whether the answer addresses the question.
    ///
    /// A failed check degrades to `false` rather than failing the branch.
    async fn check_answer(&self, question: &str, answer: &str) -> bool {
        let prompt = SUB_ANSWER_CHECK_PROMPT
            .replace("{question}", question)
            .replace("{answer}", answer);
        let messages = [user_message(&prompt)];
        match invoke_with_retries(
            "check_sub_answer",
            self.config.timeout,
            self.config.max_retries,
            || self.fast.invoke(&messages),
        )
        .await
        {
            Ok(response) => response.to_lowercase().contains("yes"),
            Err(err) => {
                warn!(error = %err, "sub-answer quality check failed");
                false
            }
        }
    }
}
