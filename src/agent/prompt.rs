//! Prompt templates and assembly helpers.
//!
//! Templates are compiled-in constants with `{placeholder}` slots filled
//! by simple substitution. Wording here is intentionally plain; callers
//! needing different phrasing swap templates, not assembly logic.

use std::sync::LazyLock;

use regex::Regex;

use super::config::GraphConfig;
use super::message::{ChatMessage, Role, user_message};
use super::provider::{LlmProvider, invoke_with_retries};
use crate::context::Section;
use crate::tokenizer::Tokenizer;

/// Input-token budget assumed for the generating models.
///
/// Conservative floor for current frontier context windows; callers with
/// smaller models pass their own limit to the pruner instead.
pub const MAX_PROMPT_TOKENS: usize = 128_000;

/// Sentinel a model emits when it cannot answer from the context.
///
/// Answers equal to this (case-insensitive) are treated as absent by the
/// quality gate and the good-sub-question accounting.
pub const UNKNOWN_ANSWER: &str = "unknown";

/// Strict yes/no relevance check for one document against a question.
pub const VERIFIER_PROMPT: &str = "\
Determine whether the following document is relevant for answering the question. \
Respond with exactly 'yes' or 'no' and nothing else.

Question:
{question}

Document:
{document}";

/// Initial decomposition of the user query into sub-questions.
pub const DECOMPOSITION_PROMPT: &str = "\
Decompose the question below into at most {max_sub_questions} self-contained \
sub-questions that would each help answer it. Respond with one sub-question \
per line and no numbering. If the question is already atomic, respond with \
the question itself.

Question:
{question}";

/// Answer synthesis for a single sub-question from its verified context.
pub const SUB_ANSWER_PROMPT: &str = "\
Answer the sub-question strictly from the context documents. If the context \
does not contain the answer, respond with exactly 'unknown'.

Original question:
{original_question}

Sub-question:
{question}

Context:
{context}";

/// Self-check that a sub-answer actually addresses its sub-question.
pub const SUB_ANSWER_CHECK_PROMPT: &str = "\
Does the answer below actually address the question? Respond with exactly \
'yes' or 'no'.

Question:
{question}

Answer:
{answer}";

/// Initial answer over the consolidated context and sub-answers.
pub const INITIAL_ANSWER_PROMPT: &str = "\
{persona}

Answer the question using the context documents and the answered \
sub-questions. Cite documents as [D1], [D2], ... where used. If the context \
is insufficient, say so plainly.
{history}
Question:
{question}

Answered sub-questions:
{answered_sub_questions}

Context:
{context}";

/// Quality gate on the initial answer.
pub const ANSWER_QUALITY_CHECK_PROMPT: &str = "\
Does the answer below fully address the question? Respond with exactly \
'yes' or 'no'.

Question:
{question}

Answer:
{answer}";

/// Structured entity/relationship/term extraction over sampled docs.
pub const ENTITY_TERM_EXTRACTION_PROMPT: &str = "\
Extract the important entities, relationships, and terms from the context \
as they relate to the question. Respond with a JSON object of the shape \
{\"entities\": [{\"entity_name\": str, \"entity_type\": str}], \
\"relationships\": [{\"relationship_name\": str, \"relationship_type\": str, \
\"relationship_entities\": [str]}], \"terms\": [{\"term_name\": str, \
\"term_type\": str, \"term_similar_to\": [str]}]} and no other text.

Question:
{question}

Context:
{context}";

/// Follow-up sub-question generation for the refinement round.
pub const FOLLOW_UP_DECOMPOSITION_PROMPT: &str = "\
The initial answer below did not fully address the question. Using the \
extracted entities and terms, propose at most {max_sub_questions} new \
sub-questions that would close the gaps. Respond with one sub-question per \
line and no numbering. Do not repeat earlier sub-questions.

Question:
{question}

Initial answer:
{initial_answer}

Entities and terms:
{entity_term_context}

Earlier sub-questions:
{earlier_sub_questions}";

/// Refined answer over the enlarged context.
pub const REFINED_ANSWER_PROMPT: &str = "\
{persona}

Improve the initial answer using the context documents and all answered \
sub-questions. Cite documents as [D1], [D2], ... where used.
{history}
Question:
{question}

Initial answer:
{initial_answer}

Answered sub-questions:
{answered_sub_questions}

Context:
{context}";

/// Chat-history summarization when the raw history is too long.
pub const HISTORY_SUMMARIZATION_PROMPT: &str = "\
Summarize the conversation below in a short paragraph, keeping only what \
matters for answering the new question.

New question:
{question}

Conversation:
{history}";

/// One answered sub-question block inside an answer prompt.
pub const SUB_QUESTION_ANSWER_TEMPLATE: &str = "\
Sub-question {num} ({kind}): {question}
Answer: {answer}";

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"\[\[?D?\d+\]\]?").unwrap();
    re
});

/// Whether an answer is present and not the unknown sentinel.
#[must_use]
pub fn is_real_answer(answer: &str) -> bool {
    let trimmed = answer.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(UNKNOWN_ANSWER)
}

/// Removes `[D1]`-style citations so nested prompts don't inherit stale
/// document numbering.
#[must_use]
pub fn remove_document_citations(text: &str) -> String {
    CITATION.replace_all(text, "").to_string()
}

/// Renders sections as numbered citation blocks.
#[must_use]
pub fn format_docs(sections: &[Section]) -> String {
    if sections.is_empty() {
        return "No context documents are available.".to_string();
    }
    sections
        .iter()
        .enumerate()
        .map(|(ind, section)| section.context_block(ind))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trims `piece` so it fits the model window alongside `reserved`.
///
/// A conservative one-token-per-character early-out skips tokenization
/// entirely for prompts that obviously fit.
#[must_use]
pub fn trim_prompt_piece(
    tokenizer: &Tokenizer,
    max_input_tokens: usize,
    piece: &str,
    reserved: &str,
) -> String {
    if piece.len() + reserved.len() < max_input_tokens {
        return piece.to_string();
    }
    let reserved_tokens = tokenizer.count(reserved);
    tokenizer.trim(piece, max_input_tokens.saturating_sub(reserved_tokens))
}

/// Flattens chat history into a prompt block, summarizing when long.
///
/// Consecutive assistant turns collapse to the last one (earlier drafts
/// carry no extra signal). History above the configured word threshold is
/// summarized by the fast model; if that call fails the raw history is
/// word-truncated instead, never dropped silently.
pub async fn build_history_prompt(
    provider: &dyn LlmProvider,
    config: &GraphConfig,
    history: &[ChatMessage],
    question: &str,
) -> String {
    let mut components: Vec<String> = Vec::new();
    let mut previous_role = None;
    for message in history {
        match message.role {
            Role::User => {
                components.push(format!("User: {}\n", message.content));
                previous_role = Some(Role::User);
            }
            Role::Assistant => {
                if previous_role == Some(Role::Assistant) {
                    components.pop();
                }
                components.push(format!("Assistant: {}\n", message.content));
                previous_role = Some(Role::Assistant);
            }
            Role::System => {}
        }
    }

    let mut flattened = remove_document_citations(&components.join("\n"));
    if flattened.trim().is_empty() {
        return String::new();
    }

    let word_count = flattened.split_whitespace().count();
    if word_count > config.max_history_words {
        let prompt = HISTORY_SUMMARIZATION_PROMPT
            .replace("{question}", question)
            .replace("{history}", &flattened);
        let messages = [user_message(&prompt)];
        match invoke_with_retries("summarize_history", config.timeout, config.max_retries, || {
            provider.invoke(&messages)
        })
        .await
        {
            Ok(summary) => flattened = summary,
            Err(_) => {
                flattened = flattened
                    .split_whitespace()
                    .take(config.max_history_words)
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }
    }

    format!("\nConversation so far:\n{flattened}\n")
}
