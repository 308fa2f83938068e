//! Section pruning against a token budget.
//!
//! Reproduces the document-pruning contract used by the answer pipeline:
//! reorder relevant sections first, drop ignored ones, walk the rest in
//! order accumulating serialized token counts, and resolve the cut point
//! according to the selection mode. The caller's sections are cloned, not
//! mutated.

use tracing::{error, warn};

use super::section::Section;
use crate::error::PruneError;
use crate::tokenizer::Tokenizer;

/// Token length a single embedding-model chunk is expected to occupy.
pub const EMBEDDING_CHUNK_TOKENS: usize = 1024;

/// Estimated token overhead of a section's title/metadata framing.
///
/// The selection UI refuses documents when fewer than this many tokens
/// remain, so trims below this floor are an error condition, not a normal
/// path.
pub const METADATA_TOKEN_ESTIMATE: usize = 75;

/// Limits and mode flags for one pruning invocation.
#[derive(Debug, Clone, Default)]
pub struct PruningConfig {
    /// Cap as a chunk count; converted to tokens via
    /// [`EMBEDDING_CHUNK_TOKENS`].
    pub max_chunks: Option<usize>,
    /// Cap as a fraction of the model's document-token window.
    pub max_window_percentage: Option<f64>,
    /// Cap as an absolute token count.
    pub max_tokens: Option<usize>,
    /// Tokens already reserved for tool definitions in the prompt.
    pub tool_token_count: usize,
    /// Sections come from explicit user document selection. No silent
    /// drops allowed: only the final document may be truncated.
    pub is_manually_selected_docs: bool,
    /// Retrieval units are pre-merged sections rather than single chunks,
    /// so the final section is truncated instead of dropped.
    pub use_sections: bool,
    /// Serialize sections as tool-call JSON documents instead of
    /// citation-style context blocks when counting.
    pub using_tool_message: bool,
}

/// Resolves the effective token limit from all non-null candidates.
///
/// The model-derived document window (minus reserved tool tokens) always
/// participates when present; zero-valued candidates are discarded the
/// same way absent ones are.
fn compute_limit(
    config: &PruningConfig,
    model_max_document_tokens: Option<usize>,
) -> Result<usize, PruneError> {
    let model_limit =
        model_max_document_tokens.map(|max| max.saturating_sub(config.tool_token_count));

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let window_limit = match (config.max_window_percentage, model_limit) {
        (Some(pct), Some(model)) if pct > 0.0 => Some((pct * model as f64) as usize),
        _ => None,
    };
    let chunk_limit = config.max_chunks.map(|chunks| chunks * EMBEDDING_CHUNK_TOKENS);

    [window_limit, chunk_limit, config.max_tokens, model_limit]
        .into_iter()
        .flatten()
        .filter(|&limit| limit > 0)
        .min()
        .ok_or(PruneError::NoTokenLimit)
}

/// Moves relevance-marked sections ahead of the rest.
///
/// Both groups keep their original relative order. No-op when no
/// relevance list was produced for this question.
fn reorder_sections(sections: Vec<Section>, relevance_list: Option<&[bool]>) -> Vec<Section> {
    let Some(relevance) = relevance_list else {
        return sections;
    };

    let mut reordered = Vec::with_capacity(sections.len());
    for target in [true, false] {
        for (section, &is_relevant) in sections.iter().zip(relevance) {
            if is_relevant == target {
                reordered.push(section.clone());
            }
        }
    }
    reordered
}

/// Serializes a section the way it will appear in the prompt.
fn section_prompt_str(section: &Section, ind: usize, using_tool_message: bool) -> String {
    if using_tool_message {
        section.to_tool_document(ind).to_string()
    } else {
        section.context_block(ind)
    }
}

/// Fits `sections` into the resolved token budget.
///
/// Sections are walked in (relevance-reordered) rank order; the first
/// section whose inclusion would exceed the limit becomes the cut point,
/// resolved by mode:
///
/// - **manual / section mode**: everything after the cut is dropped
///   (manual selection fails instead of dropping), then the final kept
///   section's content is trimmed to exactly fill the remaining budget,
///   or removed entirely when even its framing does not fit.
/// - **chunk mode**: the cut section and everything after it are dropped,
///   unless the cut is the very first section, which is kept trimmed to
///   `limit - METADATA_TOKEN_ESTIMATE`.
///
/// An empty result is a valid terminal state; callers render a
/// no-context prompt.
///
/// # Errors
///
/// [`PruneError::NoTokenLimit`] when no limit candidate resolves,
/// [`PruneError::RelevanceLengthMismatch`] for a misaligned relevance
/// list, and [`PruneError::ContextWindowExceeded`] when manually selected
/// documents would have to be dropped.
pub fn prune_sections(
    sections: &[Section],
    relevance_list: Option<&[bool]>,
    config: &PruningConfig,
    model_max_document_tokens: Option<usize>,
    tokenizer: &Tokenizer,
) -> Result<Vec<Section>, PruneError> {
    if let Some(relevance) = relevance_list
        && relevance.len() != sections.len()
    {
        return Err(PruneError::RelevanceLengthMismatch {
            relevance_len: relevance.len(),
            section_count: sections.len(),
        });
    }

    let token_limit = compute_limit(config, model_max_document_tokens)?;

    let mut sections = reorder_sections(sections.to_vec(), relevance_list);
    sections.retain(|section| !section.ignored_for_qa());

    let mut final_section_ind = None;
    let mut total_tokens = 0usize;
    for (ind, section) in sections.iter_mut().enumerate() {
        let section_str = section_prompt_str(section, ind, config.using_tool_message);
        let mut section_tokens = tokenizer.count(&section_str);

        // A chunk-level section much longer than one embedding chunk means
        // the embedding tokenizer and the LLM tokenizer disagree.
        if !config.is_manually_selected_docs
            && !config.use_sections
            && section_tokens > EMBEDDING_CHUNK_TOKENS + METADATA_TOKEN_ESTIMATE
        {
            warn!(
                document_id = %section.document_id,
                chunk_id = section.chunk_id,
                section_tokens,
                "found more tokens in section than expected, likely mismatch between \
                 embedding and LLM tokenizers; trimming content"
            );
            section.combined_content =
                tokenizer.trim(&section.combined_content, EMBEDDING_CHUNK_TOKENS);
            section_tokens = EMBEDDING_CHUNK_TOKENS;
        }

        total_tokens += section_tokens;
        if total_tokens > token_limit {
            final_section_ind = Some(ind);
            break;
        }
    }

    let Some(final_ind) = final_section_ind else {
        return Ok(sections);
    };

    if config.is_manually_selected_docs || config.use_sections {
        if final_ind != sections.len() - 1 {
            sections.truncate(final_ind + 1);

            if config.is_manually_selected_docs {
                // Only the final selected document may be truncated; a
                // deeper cut would silently drop whole documents.
                return Err(PruneError::ContextWindowExceeded);
            }
        }

        let amount_to_truncate = total_tokens - token_limit;
        // Recalculate against the raw content: the walk above counted the
        // serialized form, whose framing overhead must not be trimmed out
        // of the content itself.
        let content_tokens = tokenizer.count(&sections[final_ind].combined_content);
        let final_doc_content_length = content_tokens as i64 - amount_to_truncate as i64;

        if final_doc_content_length <= 0 {
            // Only space left for the title/metadata.
            error!(
                semantic_identifier = %sections[final_ind].semantic_identifier,
                "final section content length is less than 0; removing this section \
                 from the final prompt"
            );
            sections.pop();
        } else {
            #[allow(clippy::cast_sign_loss)]
            let desired = final_doc_content_length as usize;
            sections[final_ind].combined_content =
                tokenizer.trim(&sections[final_ind].combined_content, desired);
        }
    } else if final_ind != 0 {
        // Chunk-level search: whole chunks are dropped, never truncated,
        // unless only one fits at all.
        sections.truncate(final_ind);
    } else {
        sections[0].combined_content = tokenizer.trim(
            &sections[0].combined_content,
            token_limit.saturating_sub(METADATA_TOKEN_ESTIMATE),
        );
        sections.truncate(1);
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::for_model("test-model")
    }

    fn section_with_tokens(document_id: &str, token_count: usize) -> Section {
        let content = (0..token_count)
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        Section::new(document_id, 0, content)
    }

    fn chunk_config() -> PruningConfig {
        PruningConfig {
            max_tokens: Some(800),
            ..PruningConfig::default()
        }
    }

    fn serialized_tokens(sections: &[Section], config: &PruningConfig) -> usize {
        let tok = tokenizer();
        sections
            .iter()
            .enumerate()
            .map(|(ind, s)| tok.count(&section_prompt_str(s, ind, config.using_tool_message)))
            .sum()
    }

    #[test]
    fn test_no_resolvable_limit_is_configuration_error() {
        let result = prune_sections(
            &[section_with_tokens("a", 10)],
            None,
            &PruningConfig::default(),
            None,
            &tokenizer(),
        );
        assert!(matches!(result, Err(PruneError::NoTokenLimit)));
    }

    #[test]
    fn test_effective_limit_is_minimum_of_candidates() {
        // max_chunks -> 1 * 1024 beats max_tokens 10_000 and the model
        // window: only one ~600-token section survives.
        let config = PruningConfig {
            max_chunks: Some(1),
            max_tokens: Some(10_000),
            ..PruningConfig::default()
        };
        let sections = vec![
            section_with_tokens("a", 600),
            section_with_tokens("b", 600),
        ];
        let pruned = prune_sections(&sections, None, &config, Some(20_000), &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].document_id, "a");
    }

    #[test]
    fn test_zero_valued_limits_are_ignored() {
        let config = PruningConfig {
            max_chunks: Some(0),
            max_tokens: Some(0),
            ..PruningConfig::default()
        };
        let result = prune_sections(
            &[section_with_tokens("a", 10)],
            None,
            &config,
            None,
            &tokenizer(),
        );
        assert!(matches!(result, Err(PruneError::NoTokenLimit)));
    }

    #[test]
    fn test_chunk_mode_drops_cut_section_and_tail() {
        // A(500) fits; A+B(400) exceeds 800; cut at B (index 1, not 0)
        // so B and C are dropped whole.
        let sections = vec![
            section_with_tokens("a", 500),
            section_with_tokens("b", 400),
            section_with_tokens("c", 300),
        ];
        let pruned = prune_sections(&sections, None, &chunk_config(), None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].document_id, "a");
        // Unchanged content for kept sections.
        assert_eq!(pruned[0].combined_content, sections[0].combined_content);
    }

    #[test]
    fn test_chunk_mode_truncates_lone_oversized_section() {
        let sections = vec![section_with_tokens("a", 1000)];
        let pruned = prune_sections(&sections, None, &chunk_config(), None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 1);
        assert_eq!(
            tokenizer().count(&pruned[0].combined_content),
            800 - METADATA_TOKEN_ESTIMATE
        );
    }

    #[test_case(true, false; "manually selected docs")]
    #[test_case(false, true; "section mode")]
    fn test_final_section_truncated_to_fill_budget(manual: bool, use_sections: bool) {
        let config = PruningConfig {
            max_tokens: Some(900),
            is_manually_selected_docs: manual,
            use_sections,
            ..PruningConfig::default()
        };
        let sections = vec![
            section_with_tokens("a", 400),
            section_with_tokens("b", 400),
            section_with_tokens("c", 400),
        ];
        let pruned = prune_sections(&sections, None, &config, None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 3);

        // The cut section's raw content was trimmed by exactly the
        // serialized overshoot.
        let overshoot = serialized_tokens(&sections, &config) - 900;
        assert_eq!(
            tokenizer().count(&pruned[2].combined_content),
            400 - overshoot
        );
        assert!(serialized_tokens(&pruned, &config) <= 900 + METADATA_TOKEN_ESTIMATE);
    }

    #[test]
    fn test_manual_mode_errors_when_non_final_docs_would_drop() {
        let config = PruningConfig {
            max_tokens: Some(500),
            is_manually_selected_docs: true,
            ..PruningConfig::default()
        };
        let sections = vec![
            section_with_tokens("a", 400),
            section_with_tokens("b", 400),
            section_with_tokens("c", 400),
        ];
        let result = prune_sections(&sections, None, &config, None, &tokenizer());
        assert!(matches!(result, Err(PruneError::ContextWindowExceeded)));
    }

    #[test]
    fn test_section_mode_drops_tail_then_truncates_new_final() {
        let config = PruningConfig {
            max_tokens: Some(500),
            use_sections: true,
            ..PruningConfig::default()
        };
        let sections = vec![
            section_with_tokens("a", 400),
            section_with_tokens("b", 400),
            section_with_tokens("c", 400),
        ];
        let pruned = prune_sections(&sections, None, &config, None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[1].document_id, "b");
        assert!(tokenizer().count(&pruned[1].combined_content) < 400);
    }

    #[test]
    fn test_final_section_dropped_when_trim_target_not_positive() {
        let config = PruningConfig {
            max_tokens: Some(406),
            is_manually_selected_docs: true,
            ..PruningConfig::default()
        };
        // A(400) fits; B(10) pushes the serialized total past 406 by more
        // than B's raw content, so B is dropped entirely.
        let sections = vec![
            section_with_tokens("a", 400),
            section_with_tokens("b", 10),
        ];
        let pruned = prune_sections(&sections, None, &config, None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].document_id, "a");
    }

    #[test]
    fn test_empty_result_is_valid_terminal_state() {
        let config = PruningConfig {
            max_tokens: Some(2),
            use_sections: true,
            ..PruningConfig::default()
        };
        let pruned = prune_sections(
            &[section_with_tokens("a", 10)],
            None,
            &config,
            None,
            &tokenizer(),
        )
        .unwrap_or_else(|_| unreachable!());
        assert!(pruned.is_empty());
    }

    #[test]
    fn test_pruning_fitting_list_is_identity() {
        let sections = vec![
            section_with_tokens("a", 100),
            section_with_tokens("b", 100),
        ];
        let pruned = prune_sections(&sections, None, &chunk_config(), None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 2);
        for (before, after) in sections.iter().zip(&pruned) {
            assert_eq!(before.combined_content, after.combined_content);
        }

        // Idempotent: pruning the pruned list changes nothing.
        let again = prune_sections(&pruned, None, &chunk_config(), None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(again.len(), pruned.len());
    }

    #[test]
    fn test_ignored_sections_removed_before_budgeting() {
        let mut ignored = section_with_tokens("skip", 100);
        ignored.metadata.insert(
            crate::context::IGNORE_FOR_QA.to_string(),
            "true".to_string(),
        );
        let sections = vec![
            ignored,
            section_with_tokens("a", 100),
        ];
        let pruned = prune_sections(&sections, None, &chunk_config(), None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].document_id, "a");
    }

    #[test]
    fn test_tokenizer_mismatch_guard_force_trims_chunk() {
        let config = PruningConfig {
            max_tokens: Some(10_000),
            ..PruningConfig::default()
        };
        let sections = vec![section_with_tokens("a", EMBEDDING_CHUNK_TOKENS + 300)];
        let pruned = prune_sections(&sections, None, &config, None, &tokenizer())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(
            tokenizer().count(&pruned[0].combined_content),
            EMBEDDING_CHUNK_TOKENS
        );
        // Caller's section is untouched.
        assert_eq!(
            tokenizer().count(&sections[0].combined_content),
            EMBEDDING_CHUNK_TOKENS + 300
        );
    }

    #[test]
    fn test_relevance_length_mismatch_rejected() {
        let sections = vec![section_with_tokens("a", 10)];
        let result = prune_sections(
            &sections,
            Some(&[true, false]),
            &chunk_config(),
            None,
            &tokenizer(),
        );
        assert!(matches!(
            result,
            Err(PruneError::RelevanceLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_tool_message_serialization_counts_json_framing() {
        let section = section_with_tokens("a", 50);
        let plain = tokenizer().count(&section_prompt_str(&section, 0, false));
        let tool = tokenizer().count(&section_prompt_str(&section, 0, true));
        assert!(tool > 50);
        assert!(plain > 50);
    }

    proptest! {
        /// All relevant sections precede all others, each group keeping
        /// its input order, and the serialized result fits the limit.
        #[test]
        fn prop_reorder_law_and_budget(relevance in prop::collection::vec(any::<bool>(), 1..24)) {
            let sections: Vec<Section> = (0..relevance.len())
                .map(|i| section_with_tokens(&format!("doc-{i}"), 20))
                .collect();
            let config = PruningConfig {
                max_tokens: Some(100_000),
                ..PruningConfig::default()
            };
            let pruned = prune_sections(
                &sections,
                Some(&relevance),
                &config,
                None,
                &tokenizer(),
            )
            .unwrap_or_else(|_| unreachable!());

            prop_assert_eq!(pruned.len(), sections.len());
            let is_relevant = |s: &Section| {
                let idx: usize = s.document_id
                    .trim_start_matches("doc-")
                    .parse()
                    .unwrap_or_else(|_| unreachable!());
                relevance[idx]
            };
            // No relevant section after the first irrelevant one.
            let first_irrelevant = pruned.iter().position(|s| !is_relevant(s));
            if let Some(split) = first_irrelevant {
                prop_assert!(pruned[split..].iter().all(|s| !is_relevant(s)));
            }
            // Each group preserves input order.
            let order_of = |group: bool| -> Vec<String> {
                pruned.iter()
                    .filter(|s| is_relevant(s) == group)
                    .map(|s| s.document_id.clone())
                    .collect()
            };
            let expected_of = |group: bool| -> Vec<String> {
                sections.iter()
                    .zip(&relevance)
                    .filter(|&(_, &r)| r == group)
                    .map(|(s, _)| s.document_id.clone())
                    .collect()
            };
            prop_assert_eq!(order_of(true), expected_of(true));
            prop_assert_eq!(order_of(false), expected_of(false));
        }

        /// For any limit, the pruned serialized token count never exceeds
        /// it in chunk mode (where no framing-only remainder exists).
        #[test]
        fn prop_result_fits_budget(
            limit in 50usize..3_000,
            sizes in prop::collection::vec(5usize..400, 0..12),
        ) {
            let sections: Vec<Section> = sizes.iter()
                .enumerate()
                .map(|(i, &n)| section_with_tokens(&format!("doc-{i}"), n))
                .collect();
            let config = PruningConfig {
                max_tokens: Some(limit),
                ..PruningConfig::default()
            };
            let pruned = prune_sections(&sections, None, &config, None, &tokenizer())
                .unwrap_or_else(|_| unreachable!());

            if pruned.len() > 1 {
                prop_assert!(serialized_tokens(&pruned, &config) <= limit);
            }
        }
    }
}
