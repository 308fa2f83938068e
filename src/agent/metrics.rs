//! Run metrics and effectiveness statistics.
//!
//! Everything here is observability-only: computed once per run,
//! logged/persisted externally, and never required for answer
//! correctness.

use std::time::Duration;

use serde::Serialize;

use crate::context::Section;

/// Sentinel ratio meaning "infinitely improved" (zero baseline).
const BOOST_SENTINEL: f64 = 10.0;

/// Wall-clock durations of the run's phases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentTimings {
    /// Time to the initial answer.
    pub base_duration: Option<Duration>,
    /// Time spent in the refinement pass.
    pub refined_duration: Option<Duration>,
    /// Whole-run duration.
    pub full_duration: Option<Duration>,
}

/// Metrics for the initial (level 0) answer phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentBaseMetrics {
    /// Verified documents across all level-0 sub-questions.
    pub num_verified_documents: usize,
    /// Mean retrieval score of verified documents, when scored.
    pub verified_avg_score: Option<f64>,
    /// Duration of the base phase.
    pub duration: Option<Duration>,
}

/// Metrics for the refinement phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRefinedMetrics {
    /// Relevant-document gain over the previously verified set.
    pub refined_doc_boost_factor: f64,
    /// Good-sub-question gain over the initial round.
    pub refined_question_boost_factor: f64,
    /// Duration of the refinement phase.
    pub duration: Option<Duration>,
}

/// Fit statistics comparing verified and rejected sections.
///
/// "Fit" measures how well raw retrieval ranking agreed with the
/// verification verdicts: a healthy retriever scores verified sections
/// higher than rejected ones.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalFitStats {
    /// Sections that passed verification.
    pub verified_count: usize,
    /// Sections that failed verification.
    pub rejected_count: usize,
    /// Mean retrieval score of verified sections, when any carry scores.
    pub verified_avg_score: Option<f64>,
    /// Mean retrieval score of rejected sections, when any carry scores.
    pub rejected_avg_score: Option<f64>,
}

fn mean_score(sections: &[Section]) -> Option<f64> {
    let scores: Vec<f64> = sections.iter().filter_map(|s| s.score).collect();
    if scores.is_empty() {
        None
    } else {
        #[allow(clippy::cast_precision_loss)]
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Computes fit statistics from the retrieved set and the verified subset.
///
/// A retrieved section counts as rejected when its document+chunk key is
/// absent from the verified set.
#[must_use]
pub fn compute_fit_stats(retrieved: &[Section], verified: &[Section]) -> RetrievalFitStats {
    let verified_keys: std::collections::HashSet<_> = verified.iter().map(Section::key).collect();
    let rejected: Vec<Section> = retrieved
        .iter()
        .filter(|s| !verified_keys.contains(&s.key()))
        .cloned()
        .collect();

    RetrievalFitStats {
        verified_count: verified.len(),
        rejected_count: rejected.len(),
        verified_avg_score: mean_score(verified),
        rejected_avg_score: mean_score(&rejected),
    }
}

/// Relevant-document gain of the refinement pass.
///
/// `relevant_doc_count / previously_verified_count`, with the
/// [`BOOST_SENTINEL`] when nothing was verified before refinement
/// (signals "infinitely improved", not an error).
#[must_use]
pub fn refined_doc_effectiveness(relevant_doc_count: usize, previously_verified_count: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    if previously_verified_count > 0 {
        relevant_doc_count as f64 / previously_verified_count as f64
    } else {
        BOOST_SENTINEL
    }
}

/// Good-sub-question gain of the refinement pass.
///
/// `total_good / initial_good`, with two zero-baseline cases: revised
/// questions appearing from a zero initial baseline score the
/// [`BOOST_SENTINEL`], and both-zero scores a neutral `1.0`.
#[must_use]
pub fn revision_question_efficiency(
    initial_good_sub_questions: usize,
    revised_good_sub_questions: usize,
) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    if initial_good_sub_questions > 0 {
        (initial_good_sub_questions + revised_good_sub_questions) as f64
            / initial_good_sub_questions as f64
    } else if revised_good_sub_questions > 0 {
        BOOST_SENTINEL
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_doc_effectiveness_ratio() {
        assert!((refined_doc_effectiveness(6, 4) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_doc_effectiveness_zero_baseline_sentinel() {
        assert!((refined_doc_effectiveness(3, 0) - 10.0).abs() < f64::EPSILON);
        assert!((refined_doc_effectiveness(0, 0) - 10.0).abs() < f64::EPSILON);
    }

    #[test_case(2, 2, 2.0; "doubled questions")]
    #[test_case(2, 0, 1.0; "no new questions")]
    #[test_case(0, 3, 10.0; "revised from zero baseline")]
    #[test_case(0, 0, 1.0; "both zero is neutral")]
    fn test_revision_question_efficiency(initial: usize, revised: usize, expected: f64) {
        assert!((revision_question_efficiency(initial, revised) - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fit_stats_partitions_by_key() {
        let mut a = Section::new("doc-a", 0, "x");
        a.score = Some(0.9);
        let mut b = Section::new("doc-b", 0, "y");
        b.score = Some(0.5);
        let mut c = Section::new("doc-c", 0, "z");
        c.score = Some(0.1);

        let retrieved = vec![a.clone(), b.clone(), c];
        let verified = vec![a, b];
        let stats = compute_fit_stats(&retrieved, &verified);
        assert_eq!(stats.verified_count, 2);
        assert_eq!(stats.rejected_count, 1);
        assert!((stats.verified_avg_score.unwrap_or_default() - 0.7).abs() < 1e-9);
        assert!((stats.rejected_avg_score.unwrap_or_default() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_fit_stats_without_scores() {
        let retrieved = vec![Section::new("doc-a", 0, "x")];
        let stats = compute_fit_stats(&retrieved, &[]);
        assert_eq!(stats.rejected_count, 1);
        assert!(stats.verified_avg_score.is_none());
        assert!(stats.rejected_avg_score.is_none());
    }
}
