//! Top-level query graph: decompose, answer, verify, refine.
//!
//! [`DeepSearchAgent::run`] spawns the whole graph onto a task and hands
//! back an [`AnswerStream`]; everything the consumer sees arrives as
//! [`AnswerPacket`]s. The graph itself is a fixed node sequence with two
//! fan-out points (initial and refinement sub-question branches), merged
//! through [`MainState`] reducers.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::config::GraphConfig;
use super::message::{ChatMessage, user_message};
use super::metrics::{
    AgentBaseMetrics, AgentRefinedMetrics, AgentTimings, refined_doc_effectiveness,
    revision_question_efficiency,
};
use super::prompt::{
    ANSWER_QUALITY_CHECK_PROMPT, DECOMPOSITION_PROMPT, ENTITY_TERM_EXTRACTION_PROMPT,
    FOLLOW_UP_DECOMPOSITION_PROMPT, INITIAL_ANSWER_PROMPT, MAX_PROMPT_TOKENS,
    REFINED_ANSWER_PROMPT, SUB_QUESTION_ANSWER_TEMPLATE, build_history_prompt, format_docs,
    is_real_answer, remove_document_citations, trim_prompt_piece,
};
use super::provider::{
    LlmProvider, invoke_with_retries, next_with_timeout, open_stream_with_timeout,
};
use super::retrieval::RetrievalProvider;
use super::state::{
    FollowUpSubQuestion, MainState, MainUpdate, SubQuestionAnswerResult, dedup_sections,
    format_question_id,
};
use super::stream::{AnswerPacket, AnswerStream, EventEmitter};
use super::subquestion::SubQuestionBranch;
use crate::context::{PruningConfig, Section, prune_sections};
use crate::error::AgentError;
use crate::tokenizer::Tokenizer;

/// Default assistant persona when the caller supplies none.
const DEFAULT_PERSONA: &str = "You are a careful research assistant.";

/// The deep-search agent: orchestrates one query end to end.
pub struct DeepSearchAgent {
    primary: Arc<dyn LlmProvider>,
    fast: Arc<dyn LlmProvider>,
    retrieval: Arc<dyn RetrievalProvider>,
    config: Arc<GraphConfig>,
    tokenizer: Arc<Tokenizer>,
    persona: String,
}

/// One query plus its conversational context.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// The user's question.
    pub question: String,
    /// Prior conversation turns, oldest first.
    pub history: Vec<ChatMessage>,
}

impl QueryRequest {
    /// A request with no history.
    #[must_use]
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            history: Vec::new(),
        }
    }
}

impl DeepSearchAgent {
    /// Creates an agent over the given providers and configuration.
    #[must_use]
    pub fn new(
        primary: Arc<dyn LlmProvider>,
        fast: Arc<dyn LlmProvider>,
        retrieval: Arc<dyn RetrievalProvider>,
        config: GraphConfig,
    ) -> Self {
        let tokenizer = Arc::new(Tokenizer::for_model(&config.primary_model));
        Self {
            primary,
            fast,
            retrieval,
            config: Arc::new(config),
            tokenizer,
            persona: DEFAULT_PERSONA.to_string(),
        }
    }

    /// Overrides the assistant persona used in answer prompts.
    #[must_use]
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    /// Runs the query graph, returning the consumer's event stream.
    ///
    /// The graph runs on its own task; dropping the returned stream
    /// cancels it. The stream always terminates with a
    /// [`AnswerPacket::StreamStop`] or [`AnswerPacket::Error`].
    #[must_use]
    pub fn run(&self, request: QueryRequest) -> AnswerStream {
        let graph = GraphRun {
            primary: Arc::clone(&self.primary),
            fast: Arc::clone(&self.fast),
            retrieval: Arc::clone(&self.retrieval),
            config: Arc::clone(&self.config),
            tokenizer: Arc::clone(&self.tokenizer),
            persona: self.persona.clone(),
        };
        AnswerStream::channel(move |emitter| {
            tokio::spawn(async move {
                if let Err(err) = graph.execute(request, &emitter).await {
                    match err {
                        AgentError::Cancelled => {}
                        other => {
                            let _ = emitter
                                .emit(AnswerPacket::Error {
                                    message: other.to_string(),
                                })
                                .await;
                        }
                    }
                }
            })
        })
    }
}

/// Everything one graph execution needs, detached from the agent so the
/// run owns its handles on the spawned task.
struct GraphRun {
    primary: Arc<dyn LlmProvider>,
    fast: Arc<dyn LlmProvider>,
    retrieval: Arc<dyn RetrievalProvider>,
    config: Arc<GraphConfig>,
    tokenizer: Arc<Tokenizer>,
    persona: String,
}

impl GraphRun {
    async fn execute(
        &self,
        request: QueryRequest,
        emitter: &EventEmitter,
    ) -> Result<(), AgentError> {
        let run_start = Instant::now();
        let question = request.question.as_str();
        let mut state = MainState::default();

        let history_prompt =
            build_history_prompt(self.fast.as_ref(), &self.config, &request.history, question)
                .await;

        // Exploratory search feeds entity/term extraction later; its
        // failure costs refinement quality, not the run.
        let exploratory = match self
            .retrieval
            .search(question, self.config.num_exploratory_docs)
            .await
        {
            Ok(sections) => sections,
            Err(err) => {
                warn!(error = %err, "exploratory search failed");
                Vec::new()
            }
        };
        state.apply(MainUpdate {
            exploratory_sections: Some(exploratory),
            log_messages: vec!["exploratory_search".to_string()],
            ..MainUpdate::default()
        });

        let sub_questions = self.decompose(question, emitter).await?;
        state.apply(MainUpdate {
            initial_sub_questions: Some(sub_questions.clone()),
            log_messages: vec!["decomposition".to_string()],
            ..MainUpdate::default()
        });

        self.run_initial_branches(question, &sub_questions, &mut state, emitter)
            .await?;

        let cited: Vec<Section> = {
            let mut sections = Vec::new();
            for result in &state.sub_question_results {
                dedup_sections(&mut sections, result.verified_sections.clone());
            }
            sections
        };
        let consolidated =
            consolidate_context(&cited, &state.orig_question_sections, &self.config);
        let context_docs = self.fit_to_window(consolidated)?;
        emit_context(emitter, "search_response_summary", &context_docs, 0).await?;

        let base_start = Instant::now();
        let answered_block = answered_sub_questions_block(&state.sub_question_results);
        let initial_answer = self
            .stream_answer(
                INITIAL_ANSWER_PROMPT,
                question,
                &history_prompt,
                None,
                &answered_block,
                &context_docs,
                0,
                emitter,
            )
            .await?;

        let quality = self.check_answer_quality(question, &initial_answer).await;
        let require_refined = self.config.allow_refinement && !quality;
        state.apply(MainUpdate {
            initial_answer: Some(initial_answer.clone()),
            initial_answer_quality: Some(quality),
            require_refined_answer: Some(require_refined),
            log_messages: vec!["initial_answer".to_string()],
            ..MainUpdate::default()
        });

        let mut timings = AgentTimings {
            base_duration: Some(base_start.elapsed()),
            ..AgentTimings::default()
        };

        if !require_refined {
            if !self.config.allow_refinement {
                info!("refinement disabled by configuration");
                state.apply(MainUpdate {
                    log_messages: vec!["refinement_disabled".to_string()],
                    ..MainUpdate::default()
                });
            }
            timings.full_duration = Some(run_start.elapsed());
            self.emit_metrics(emitter, &state, &timings, 0).await?;
            emitter.emit(AnswerPacket::StreamStop { level: 0 }).await?;
            return Ok(());
        }
        emitter.emit(AnswerPacket::StreamStop { level: 0 }).await?;

        let refined_start = Instant::now();
        self.refine(
            question,
            &history_prompt,
            &context_docs,
            &mut state,
            emitter,
        )
        .await?;
        timings.refined_duration = Some(refined_start.elapsed());
        timings.full_duration = Some(run_start.elapsed());
        self.emit_metrics(emitter, &state, &timings, 1).await?;
        emitter.emit(AnswerPacket::StreamStop { level: 1 }).await?;
        Ok(())
    }

    /// Decomposes the question into at most `max_sub_questions` parts.
    ///
    /// A failed decomposition degrades to zero sub-questions; the run
    /// continues on base retrieval alone.
    async fn decompose(
        &self,
        question: &str,
        emitter: &EventEmitter,
    ) -> Result<Vec<String>, AgentError> {
        let prompt = DECOMPOSITION_PROMPT
            .replace(
                "{max_sub_questions}",
                &self.config.max_sub_questions.to_string(),
            )
            .replace("{question}", question);
        let messages = [user_message(&prompt)];
        let response = match invoke_with_retries(
            "decompose",
            self.config.timeout,
            self.config.max_retries,
            || self.primary.invoke(&messages),
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "decomposition failed; continuing without sub-questions");
                return Ok(Vec::new());
            }
        };

        let sub_questions = parse_question_lines(&response, self.config.max_sub_questions);
        for (ind, sub_question) in sub_questions.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            emitter
                .emit(AnswerPacket::SubQuestionPiece {
                    sub_question: sub_question.clone(),
                    level: 0,
                    level_question_num: ind as u32 + 1,
                })
                .await?;
        }
        Ok(sub_questions)
    }

    /// Runs level-0 branches plus base retrieval concurrently.
    async fn run_initial_branches(
        &self,
        question: &str,
        sub_questions: &[String],
        state: &mut MainState,
        emitter: &EventEmitter,
    ) -> Result<(), AgentError> {
        let branch = self.branch(emitter);
        let mut handles = Vec::with_capacity(sub_questions.len());
        for (ind, sub_question) in sub_questions.iter().enumerate() {
            let branch = branch.clone();
            let question = question.to_string();
            let sub_question = sub_question.clone();
            #[allow(clippy::cast_possible_truncation)]
            let num = ind as u32 + 1;
            handles.push(tokio::spawn(async move {
                branch.run(&question, &sub_question, 0, num).await
            }));
        }

        let base = self
            .retrieval
            .search(question, self.config.retrieval_limit)
            .await;
        match base {
            Ok(sections) => state.apply(MainUpdate {
                orig_question_sections: sections,
                log_messages: vec!["base_retrieval".to_string()],
                ..MainUpdate::default()
            }),
            Err(err) => {
                warn!(error = %err, "base retrieval failed; answering from sub-question context");
            }
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => state.apply(MainUpdate {
                    documents: outcome.result.verified_sections.clone(),
                    orig_question_sections: outcome.retrieved_sections,
                    sub_question_results: vec![outcome.result],
                    ..MainUpdate::default()
                }),
                Ok(Err(AgentError::Cancelled)) => return Err(AgentError::Cancelled),
                Ok(Err(err)) => {
                    warn!(error = %err, "sub-question branch failed");
                }
                Err(err) => {
                    warn!(error = %err, "sub-question branch panicked or was aborted");
                }
            }
        }
        Ok(())
    }

    /// The refinement pass: extract, re-decompose, re-answer.
    async fn refine(
        &self,
        question: &str,
        history_prompt: &str,
        base_context: &[Section],
        state: &mut MainState,
        emitter: &EventEmitter,
    ) -> Result<(), AgentError> {
        let extraction_docs: Vec<Section> = state
            .exploratory_sections
            .iter()
            .take(self.config.num_exploratory_docs)
            .cloned()
            .collect();
        let extraction_prompt = ENTITY_TERM_EXTRACTION_PROMPT
            .replace("{question}", question)
            .replace(
                "{context}",
                &trim_prompt_piece(
                    &self.tokenizer,
                    MAX_PROMPT_TOKENS,
                    &format_docs(&extraction_docs),
                    question,
                ),
            );
        let messages = [user_message(&extraction_prompt)];
        let extraction = match invoke_with_retries(
            "extract_entities_terms",
            self.config.timeout,
            self.config.max_retries,
            || self.fast.invoke(&messages),
        )
        .await
        {
            Ok(response) => super::extraction::parse_extraction(&response),
            Err(err) => {
                warn!(error = %err, "entity/term extraction failed");
                super::extraction::EntityRelationshipTermExtraction::default()
            }
        };

        let entity_term_context =
            serde_json::to_string(&extraction).unwrap_or_else(|_| "{}".to_string());
        let earlier: Vec<String> = state
            .sub_question_results
            .iter()
            .map(|r| r.question.clone())
            .collect();
        let follow_up_prompt = FOLLOW_UP_DECOMPOSITION_PROMPT
            .replace(
                "{max_sub_questions}",
                &self.config.max_sub_questions.to_string(),
            )
            .replace("{question}", question)
            .replace(
                "{initial_answer}",
                &remove_document_citations(&state.initial_answer),
            )
            .replace("{entity_term_context}", &entity_term_context)
            .replace("{earlier_sub_questions}", &earlier.join("\n"));
        let messages = [user_message(&follow_up_prompt)];
        let follow_up_questions = match invoke_with_retries(
            "follow_up_decompose",
            self.config.timeout,
            self.config.max_retries,
            || self.primary.invoke(&messages),
        )
        .await
        {
            Ok(response) => parse_question_lines(&response, self.config.max_sub_questions),
            Err(err) => {
                warn!(error = %err, "follow-up decomposition failed");
                Vec::new()
            }
        };

        state.apply(MainUpdate {
            entity_extraction: Some(extraction),
            log_messages: vec!["entity_term_extraction".to_string()],
            ..MainUpdate::default()
        });

        let branch = self.branch(emitter);
        let mut handles = Vec::with_capacity(follow_up_questions.len());
        for (ind, follow_up) in follow_up_questions.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let num = ind as u32 + 1;
            emitter
                .emit(AnswerPacket::SubQuestionPiece {
                    sub_question: follow_up.clone(),
                    level: 1,
                    level_question_num: num,
                })
                .await?;
            let branch = branch.clone();
            let question = question.to_string();
            let follow_up = follow_up.clone();
            handles.push(tokio::spawn(async move {
                branch.run(&question, &follow_up, 1, num).await
            }));
        }

        let mut follow_ups = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    follow_ups.push(FollowUpSubQuestion {
                        sub_question: outcome.result.question.clone(),
                        sub_question_id: outcome.result.question_id.clone(),
                        verified: outcome.result.verified_high_quality,
                        answered: is_real_answer(&outcome.result.answer),
                        answer: outcome.result.answer.clone(),
                    });
                    state.apply(MainUpdate {
                        refined_sections: outcome.result.verified_sections.clone(),
                        sub_question_results: vec![outcome.result],
                        ..MainUpdate::default()
                    });
                }
                Ok(Err(AgentError::Cancelled)) => return Err(AgentError::Cancelled),
                Ok(Err(err)) => {
                    warn!(error = %err, "follow-up branch failed");
                }
                Err(err) => {
                    warn!(error = %err, "follow-up branch panicked or was aborted");
                }
            }
        }
        state.apply(MainUpdate {
            follow_up_sub_questions: Some(follow_ups),
            log_messages: vec!["follow_up_branches".to_string()],
            ..MainUpdate::default()
        });

        let mut refined_context = base_context.to_vec();
        dedup_sections(&mut refined_context, state.refined_sections.clone());
        let refined_context = self.fit_to_window(refined_context)?;
        emit_context(emitter, "refined_response_summary", &refined_context, 1).await?;

        let answered_block = answered_sub_questions_block(&state.sub_question_results);
        let refined_answer = self
            .stream_answer(
                REFINED_ANSWER_PROMPT,
                question,
                history_prompt,
                Some(&state.initial_answer),
                &answered_block,
                &refined_context,
                1,
                emitter,
            )
            .await?;

        state.apply(MainUpdate {
            refined_answer: Some(refined_answer),
            log_messages: vec!["refined_answer".to_string()],
            ..MainUpdate::default()
        });
        Ok(())
    }

    fn branch(&self, emitter: &EventEmitter) -> SubQuestionBranch {
        SubQuestionBranch {
            primary: Arc::clone(&self.primary),
            fast: Arc::clone(&self.fast),
            retrieval: Arc::clone(&self.retrieval),
            tokenizer: Arc::clone(&self.tokenizer),
            config: Arc::clone(&self.config),
            emitter: emitter.clone(),
        }
    }

    /// Prunes consolidated context into the model window.
    fn fit_to_window(&self, sections: Vec<Section>) -> Result<Vec<Section>, AgentError> {
        let pruning = PruningConfig::default();
        let fitted = prune_sections(
            &sections,
            None,
            &pruning,
            Some(MAX_PROMPT_TOKENS),
            &self.tokenizer,
        )?;
        Ok(fitted)
    }

    /// Streams one answer generation, returning the full text.
    #[allow(clippy::too_many_arguments)]
    async fn stream_answer(
        &self,
        template: &str,
        question: &str,
        history_prompt: &str,
        initial_answer: Option<&str>,
        answered_block: &str,
        context_docs: &[Section],
        level: u32,
        emitter: &EventEmitter,
    ) -> Result<String, AgentError> {
        let context = trim_prompt_piece(
            &self.tokenizer,
            MAX_PROMPT_TOKENS,
            &format_docs(context_docs),
            question,
        );
        let mut prompt = template
            .replace("{persona}", &self.persona)
            .replace("{history}", history_prompt)
            .replace("{question}", question)
            .replace("{answered_sub_questions}", answered_block)
            .replace("{context}", &context);
        if let Some(initial) = initial_answer {
            prompt = prompt.replace("{initial_answer}", initial);
        }

        let messages = [user_message(&prompt)];
        let mut stream = open_stream_with_timeout(
            "generate_answer",
            self.config.timeout,
            self.primary.as_ref(),
            &messages,
        )
        .await?;

        let mut answer = String::new();
        while let Some(text) = next_with_timeout(&mut stream, self.config.timeout).await? {
            answer.push_str(&text);
            emitter
                .emit(AnswerPacket::AnswerPiece {
                    answer_piece: text,
                    level,
                    level_question_num: 0,
                })
                .await?;
        }
        Ok(answer)
    }

    /// Grades the initial answer; LLM failures fall back to the
    /// presence heuristic.
    async fn check_answer_quality(&self, question: &str, answer: &str) -> bool {
        if !is_real_answer(answer) {
            return false;
        }
        let prompt = ANSWER_QUALITY_CHECK_PROMPT
            .replace("{question}", question)
            .replace("{answer}", answer);
        let messages = [user_message(&prompt)];
        match invoke_with_retries(
            "check_answer_quality",
            self.config.timeout,
            self.config.max_retries,
            || self.fast.invoke(&messages),
        )
        .await
        {
            Ok(response) => response.to_lowercase().contains("yes"),
            Err(err) => {
                warn!(error = %err, "answer quality check failed; keeping heuristic verdict");
                true
            }
        }
    }

    /// Emits the run's metrics as a final tool response.
    async fn emit_metrics(
        &self,
        emitter: &EventEmitter,
        state: &MainState,
        timings: &AgentTimings,
        level: u32,
    ) -> Result<(), AgentError> {
        let (initial_good, revised_good) = good_sub_question_counts(&state.sub_question_results);
        let previously_verified = state.documents.len();
        let base = AgentBaseMetrics {
            num_verified_documents: previously_verified,
            verified_avg_score: mean_section_score(&state.documents),
            duration: timings.base_duration,
        };
        let refined = AgentRefinedMetrics {
            refined_doc_boost_factor: refined_doc_effectiveness(
                state.refined_sections.len(),
                previously_verified,
            ),
            refined_question_boost_factor: revision_question_efficiency(
                initial_good,
                revised_good,
            ),
            duration: timings.refined_duration,
        };
        let metrics = serde_json::json!({
            "timings": timings,
            "initial_answer_quality": state.initial_answer_quality,
            "base": base,
            "refined": refined,
            "log_messages": state.log_messages,
        });
        emitter
            .emit(AnswerPacket::ToolResponse {
                id: "agent_metrics".to_string(),
                response: metrics,
                level,
                level_question_num: 0,
            })
            .await
    }
}

/// Splits an LLM decomposition response into clean question lines.
fn parse_question_lines(response: &str, max: usize) -> Vec<String> {
    response
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*'])
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')'])
                .trim()
        })
        .filter(|line| !line.is_empty())
        .take(max)
        .map(str::to_string)
        .collect()
}

/// Builds the consolidated answer context: cited sections first, then
/// original-question sections backfilled under the dual cap.
///
/// Backfill admits an uncited section while the count admitted so far
/// has not passed the configured minimum, or while the combined context
/// is still under one and a half times the document cap. The minimum
/// check runs before counting the current section, so a full context
/// still receives one more than the minimum. Both conditions false
/// stops the scan.
fn consolidate_context(
    cited: &[Section],
    orig_question_sections: &[Section],
    config: &GraphConfig,
) -> Vec<Section> {
    let mut combined = Vec::new();
    dedup_sections(&mut combined, cited.to_vec());

    #[allow(clippy::cast_precision_loss)]
    let cap = 1.5 * config.max_answer_context_docs as f64;
    let mut admitted = 0usize;
    for section in orig_question_sections {
        if combined.iter().any(|s| s.key() == section.key()) {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        if admitted <= config.min_orig_question_docs || (combined.len() as f64) < cap {
            combined.push(section.clone());
            admitted += 1;
        } else {
            break;
        }
    }
    combined
}

/// Renders answered sub-questions for an answer prompt.
fn answered_sub_questions_block(results: &[SubQuestionAnswerResult]) -> String {
    let answered: Vec<String> = results
        .iter()
        .filter(|r| is_real_answer(&r.answer))
        .map(|r| {
            let (level, num) = super::state::parse_question_id(&r.question_id);
            let kind = if level == 0 { "initial" } else { "refined" };
            SUB_QUESTION_ANSWER_TEMPLATE
                .replace("{num}", &format_question_id(level, num))
                .replace("{kind}", kind)
                .replace("{question}", &r.question)
                .replace("{answer}", &r.answer)
        })
        .collect();
    if answered.is_empty() {
        "No sub-questions could be answered.".to_string()
    } else {
        answered.join("\n\n")
    }
}

/// Mean retrieval score across sections that carry one.
fn mean_section_score(sections: &[Section]) -> Option<f64> {
    let scores: Vec<f64> = sections.iter().filter_map(|s| s.score).collect();
    if scores.is_empty() {
        None
    } else {
        #[allow(clippy::cast_precision_loss)]
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Counts verified, genuinely answered sub-questions per level.
fn good_sub_question_counts(results: &[SubQuestionAnswerResult]) -> (usize, usize) {
    let mut initial = 0;
    let mut revised = 0;
    for result in results {
        if !(result.verified_high_quality && is_real_answer(&result.answer)) {
            continue;
        }
        let (level, _) = super::state::parse_question_id(&result.question_id);
        if level == 0 {
            initial += 1;
        } else {
            revised += 1;
        }
    }
    (initial, revised)
}

/// Emits a context-docs tool response for a level.
async fn emit_context(
    emitter: &EventEmitter,
    id: &str,
    sections: &[Section],
    level: u32,
) -> Result<(), AgentError> {
    emitter
        .emit(AnswerPacket::ToolResponse {
            id: id.to_string(),
            response: serde_json::Value::Array(
                sections
                    .iter()
                    .enumerate()
                    .map(|(ind, s)| s.to_tool_document(ind))
                    .collect(),
            ),
            level,
            level_question_num: 0,
        })
        .await
}
