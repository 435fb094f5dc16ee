//! Precedent scoring and the shared recommendation thresholds.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{DecisionTrace, TraceOutcome};

/// Above this confidence a successful precedent is reused as-is.
pub const USE_THRESHOLD: f64 = 0.75;
/// At or above this confidence a successful precedent is reused after verification.
pub const VERIFY_THRESHOLD: f64 = 0.60;

/// A stored trace with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub trace: DecisionTrace,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    Use,
    Verify,
    NewDecision,
}

impl RecommendationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendationAction::Use => "use",
            RecommendationAction::Verify => "verify",
            RecommendationAction::NewDecision => "new_decision",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendationAction,
    pub trace: Option<TraceResult>,
    pub reason: String,
}

/// Pick the best successful precedent and classify it by confidence.
pub fn recommend(results: &[TraceResult]) -> Recommendation {
    let best = results
        .iter()
        .filter(|r| r.trace.outcome == TraceOutcome::Success)
        .fold(None::<&TraceResult>, |best, r| match best {
            Some(b) if b.confidence >= r.confidence => Some(b),
            _ => Some(r),
        });

    let Some(best) = best else {
        return Recommendation {
            action: RecommendationAction::NewDecision,
            trace: None,
            reason: "no successful precedent".to_string(),
        };
    };

    let (action, reason) = if best.confidence > USE_THRESHOLD {
        (
            RecommendationAction::Use,
            format!(
                "precedent {} succeeded with confidence {:.2}",
                best.trace.id, best.confidence
            ),
        )
    } else if best.confidence >= VERIFY_THRESHOLD {
        (
            RecommendationAction::Verify,
            format!(
                "precedent {} succeeded with moderate confidence {:.2}; verify before reuse",
                best.trace.id, best.confidence
            ),
        )
    } else {
        (
            RecommendationAction::NewDecision,
            format!(
                "best precedent {} has low confidence {:.2}",
                best.trace.id, best.confidence
            ),
        )
    };
    Recommendation {
        action,
        trace: (action != RecommendationAction::NewDecision).then(|| best.clone()),
        reason,
    }
}

/// Jaccard overlap of the lowercased word sets of `a` and `b`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a_words = words(a);
    let b_words = words(b);
    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }
    let shared = a_words.intersection(&b_words).count();
    let total = a_words.union(&b_words).count();
    shared as f64 / total as f64
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::trace;

    fn result(outcome: TraceOutcome, confidence: f64) -> TraceResult {
        TraceResult {
            trace: trace("dt-1", outcome),
            confidence,
        }
    }

    #[test]
    fn high_confidence_success_is_used() {
        let rec = recommend(&[result(TraceOutcome::Success, 0.8)]);
        assert_eq!(rec.action, RecommendationAction::Use);
        assert!(rec.trace.is_some());
    }

    #[test]
    fn moderate_confidence_is_verified() {
        assert_eq!(
            recommend(&[result(TraceOutcome::Success, 0.65)]).action,
            RecommendationAction::Verify
        );
        assert_eq!(
            recommend(&[result(TraceOutcome::Success, 0.75)]).action,
            RecommendationAction::Verify
        );
        assert_eq!(
            recommend(&[result(TraceOutcome::Success, 0.60)]).action,
            RecommendationAction::Verify
        );
    }

    #[test]
    fn low_confidence_or_empty_needs_new_decision() {
        let rec = recommend(&[result(TraceOutcome::Success, 0.4)]);
        assert_eq!(rec.action, RecommendationAction::NewDecision);
        assert!(rec.trace.is_none());
        assert_eq!(recommend(&[]).action, RecommendationAction::NewDecision);
    }

    #[test]
    fn failures_are_never_recommended() {
        let rec = recommend(&[
            result(TraceOutcome::Failure, 0.99),
            result(TraceOutcome::Success, 0.62),
        ]);
        assert_eq!(rec.action, RecommendationAction::Verify);
        assert!((rec.trace.expect("trace").confidence - 0.62).abs() < f64::EPSILON);
    }

    #[test]
    fn similarity_is_word_overlap() {
        assert!((similarity("Add login page", "add LOGIN page") - 1.0).abs() < f64::EPSILON);
        assert!((similarity("add login", "add logout") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(similarity("", "anything"), 0.0);
    }
}
