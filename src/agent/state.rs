//! Orchestration state and merge reducers.
//!
//! The graph threads one [`MainState`] through every node. Nodes never
//! mutate it directly: each returns a partial [`MainUpdate`], and the
//! runtime merges updates at join points via the per-field policy
//! declared in [`MainState::FIELD_POLICIES`]. This replaces the
//! fragment-inheritance state composition of similar pipelines with one
//! explicit struct and a tagged policy per field.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::extraction::EntityRelationshipTermExtraction;
use crate::context::{Section, SectionKey};

/// How a field's partial update combines with accumulated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// New value overwrites old (scalars: answers, flags, timestamps).
    Replace,
    /// New list concatenates onto existing. Order is branch **arrival**
    /// order, not declaration order; consumers must not depend on it.
    Append,
    /// New items merge into existing by key; first-seen wins and later
    /// duplicates are discarded silently.
    DedupeByKey,
}

/// Formats a question id from its decomposition level and index.
#[must_use]
pub fn format_question_id(level: u32, num: u32) -> String {
    format!("{level}_{num}")
}

/// Splits a question id back into `(level, num)`.
///
/// Malformed ids parse as level 0, question 0 rather than failing a run.
#[must_use]
pub fn parse_question_id(id: &str) -> (u32, u32) {
    let mut parts = id.splitn(2, '_');
    let level = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let num = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (level, num)
}

/// Merges `new` sections into `existing`, deduplicating by
/// document+chunk key with first-seen-wins semantics.
pub fn dedup_sections(existing: &mut Vec<Section>, new: Vec<Section>) {
    let mut seen: HashSet<SectionKey> = existing.iter().map(Section::key).collect();
    for section in new {
        if seen.insert(section.key()) {
            existing.push(section);
        }
    }
}

/// Merges sub-question results by question id, first-seen wins.
pub fn dedup_answer_results(
    existing: &mut Vec<SubQuestionAnswerResult>,
    new: Vec<SubQuestionAnswerResult>,
) {
    let mut seen: HashSet<String> = existing.iter().map(|r| r.question_id.clone()).collect();
    for result in new {
        if seen.insert(result.question_id.clone()) {
            existing.push(result);
        }
    }
}

/// Outcome of answering one sub-question.
///
/// Append-only: created when the orchestrator decomposes the query,
/// consumed when consolidating context, never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestionAnswerResult {
    /// Id encoding decomposition level and index (`"level_num"`).
    pub question_id: String,
    /// The sub-question text.
    pub question: String,
    /// Synthesized answer; empty when the branch failed or degraded.
    pub answer: String,
    /// Whether an LLM self-check confirmed the answer addresses the
    /// sub-question.
    pub verified_high_quality: bool,
    /// Sections that survived verification (and reranking) for this
    /// sub-question.
    pub verified_sections: Vec<Section>,
    /// Per-section relevance verdicts aligned with the retrieved set,
    /// before reranking.
    pub relevance_list: Vec<bool>,
}

impl SubQuestionAnswerResult {
    /// An unanswered placeholder for a degraded branch.
    #[must_use]
    pub fn unanswered(question_id: String, question: String) -> Self {
        Self {
            question_id,
            question,
            answer: String::new(),
            verified_high_quality: false,
            verified_sections: Vec::new(),
            relevance_list: Vec::new(),
        }
    }
}

/// A refinement-round sub-question generated from entity/term extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSubQuestion {
    /// The follow-up question text.
    pub sub_question: String,
    /// Id encoding level (always ≥ 1) and index.
    pub sub_question_id: String,
    /// Whether the answering branch verified the answer quality.
    pub verified: bool,
    /// Whether the branch produced any answer at all.
    pub answered: bool,
    /// The answer text, when answered.
    pub answer: String,
}

/// Accumulated state for one query run.
#[derive(Debug, Clone, Default)]
pub struct MainState {
    /// Node log lines, in branch arrival order.
    pub log_messages: Vec<String>,
    /// Exploratory search results for the original question.
    pub exploratory_sections: Vec<Section>,
    /// Initial decomposition of the query.
    pub initial_sub_questions: Vec<String>,
    /// Sections retrieved for the original question across branches.
    pub orig_question_sections: Vec<Section>,
    /// Sections verified by sub-question branches.
    pub documents: Vec<Section>,
    /// Per-sub-question outcomes, level 0 and refined levels alike.
    pub sub_question_results: Vec<SubQuestionAnswerResult>,
    /// The initial generated answer.
    pub initial_answer: String,
    /// Quality-gate verdict on the initial answer.
    pub initial_answer_quality: bool,
    /// Whether the refinement pass should run.
    pub require_refined_answer: bool,
    /// Structured extraction feeding follow-up question generation.
    pub entity_extraction: EntityRelationshipTermExtraction,
    /// Follow-up sub-questions for the refinement round.
    pub follow_up_sub_questions: Vec<FollowUpSubQuestion>,
    /// Sections verified by refinement-round branches.
    pub refined_sections: Vec<Section>,
    /// The refined answer, when a refinement pass ran.
    pub refined_answer: String,
}

impl MainState {
    /// Per-field merge policies, registered once at graph build time.
    ///
    /// [`MainState::apply`] implements exactly this table; keep the two
    /// in sync when adding fields.
    pub const FIELD_POLICIES: &'static [(&'static str, MergePolicy)] = &[
        ("log_messages", MergePolicy::Append),
        ("exploratory_sections", MergePolicy::Replace),
        ("initial_sub_questions", MergePolicy::Replace),
        ("orig_question_sections", MergePolicy::DedupeByKey),
        ("documents", MergePolicy::DedupeByKey),
        ("sub_question_results", MergePolicy::DedupeByKey),
        ("initial_answer", MergePolicy::Replace),
        ("initial_answer_quality", MergePolicy::Replace),
        ("require_refined_answer", MergePolicy::Replace),
        ("entity_extraction", MergePolicy::Replace),
        ("follow_up_sub_questions", MergePolicy::Replace),
        ("refined_sections", MergePolicy::DedupeByKey),
        ("refined_answer", MergePolicy::Replace),
    ];

    /// Merges one node's partial update into the accumulated state.
    pub fn apply(&mut self, update: MainUpdate) {
        self.log_messages.extend(update.log_messages);
        if let Some(sections) = update.exploratory_sections {
            self.exploratory_sections = sections;
        }
        if let Some(questions) = update.initial_sub_questions {
            self.initial_sub_questions = questions;
        }
        dedup_sections(&mut self.orig_question_sections, update.orig_question_sections);
        dedup_sections(&mut self.documents, update.documents);
        dedup_answer_results(&mut self.sub_question_results, update.sub_question_results);
        if let Some(answer) = update.initial_answer {
            self.initial_answer = answer;
        }
        if let Some(quality) = update.initial_answer_quality {
            self.initial_answer_quality = quality;
        }
        if let Some(require) = update.require_refined_answer {
            self.require_refined_answer = require;
        }
        if let Some(extraction) = update.entity_extraction {
            self.entity_extraction = extraction;
        }
        if let Some(follow_ups) = update.follow_up_sub_questions {
            self.follow_up_sub_questions = follow_ups;
        }
        dedup_sections(&mut self.refined_sections, update.refined_sections);
        if let Some(answer) = update.refined_answer {
            self.refined_answer = answer;
        }
    }
}

/// One node's partial state update.
///
/// `None`/empty fields leave the accumulated state untouched. List
/// fields carry only the node's own additions; the reducer decides how
/// they land.
#[derive(Debug, Clone, Default)]
pub struct MainUpdate {
    /// Appended log lines.
    pub log_messages: Vec<String>,
    /// Replacement exploratory results.
    pub exploratory_sections: Option<Vec<Section>>,
    /// Replacement initial decomposition.
    pub initial_sub_questions: Option<Vec<String>>,
    /// Original-question sections to dedup-merge.
    pub orig_question_sections: Vec<Section>,
    /// Verified sections to dedup-merge.
    pub documents: Vec<Section>,
    /// Sub-question outcomes to dedup-merge by question id.
    pub sub_question_results: Vec<SubQuestionAnswerResult>,
    /// Replacement initial answer.
    pub initial_answer: Option<String>,
    /// Replacement quality verdict.
    pub initial_answer_quality: Option<bool>,
    /// Replacement refinement decision.
    pub require_refined_answer: Option<bool>,
    /// Replacement extraction result.
    pub entity_extraction: Option<EntityRelationshipTermExtraction>,
    /// Replacement follow-up questions.
    pub follow_up_sub_questions: Option<Vec<FollowUpSubQuestion>>,
    /// Refinement-round sections to dedup-merge.
    pub refined_sections: Vec<Section>,
    /// Replacement refined answer.
    pub refined_answer: Option<String>,
}
