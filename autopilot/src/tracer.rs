//! Decision Tracer: stored decisions, precedent lookup and recommendations.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::core::recommend::{Recommendation, TraceResult, recommend, similarity};
use crate::core::types::{DecisionTrace, TraceCategory, TraceOutcome};
use crate::io::store::MemoryStore;

/// Fields supplied by the caller when recording a decision.
#[derive(Debug, Clone)]
pub struct TraceDraft {
    pub category: TraceCategory,
    pub description: String,
    pub decision: String,
    pub context: Value,
    pub outcome: TraceOutcome,
    pub project_path: String,
}

pub struct DecisionTracer {
    store: Arc<MemoryStore>,
}

impl DecisionTracer {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Similar traces in `category`, most similar first, newest first on ties.
    ///
    /// Confidence is the word-overlap similarity of the descriptions.
    pub fn query_precedents(
        &self,
        description: &str,
        category: TraceCategory,
        limit: usize,
    ) -> Result<Vec<TraceResult>> {
        let mut results: Vec<TraceResult> = self
            .store
            .traces_by_category(category)?
            .into_iter()
            .map(|trace| TraceResult {
                confidence: similarity(description, &trace.description),
                trace,
            })
            .filter(|r| r.confidence > 0.0)
            .collect();
        results.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.trace.updated_at.cmp(&a.trace.updated_at))
        });
        results.truncate(limit);
        debug!(category = %category, found = results.len(), "precedents queried");
        Ok(results)
    }

    pub fn store_trace(&self, draft: TraceDraft) -> Result<String> {
        let now = Utc::now();
        let id = self.store.insert_trace(|id| DecisionTrace {
            id,
            category: draft.category,
            description: draft.description,
            decision: draft.decision,
            outcome: draft.outcome,
            context: draft.context,
            project_path: draft.project_path,
            created_at: now,
            updated_at: now,
        })?;
        debug!(trace_id = %id, "decision trace stored");
        Ok(id)
    }

    pub fn update_outcome(&self, id: &str, outcome: TraceOutcome) -> Result<()> {
        self.store.update_trace_outcome(id, outcome, Utc::now())?;
        debug!(trace_id = id, outcome = outcome.as_str(), "decision outcome updated");
        Ok(())
    }

    pub fn get_recommendation(&self, results: &[TraceResult]) -> Recommendation {
        recommend(results)
    }

    pub fn trace(&self, id: &str) -> Result<Option<DecisionTrace>> {
        self.store.trace(id)
    }
}
