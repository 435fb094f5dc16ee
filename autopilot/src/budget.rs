//! Budget Controller: ledger-backed spend tracking and admission.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::budget::{BudgetLimits, SpendSnapshot, check_admission};
use crate::core::types::{Admission, CostEvent};
use crate::io::store::MemoryStore;

#[derive(Debug, Default, Clone, Copy)]
struct SessionSpend {
    spent_usd: f64,
    turns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSummary {
    pub session_id: String,
    pub session_spent_usd: f64,
    pub session_remaining_usd: f64,
    pub daily_spent_usd: f64,
    pub daily_remaining_usd: f64,
    pub session_turns: u32,
    pub ledger_entries_today: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyUsage {
    pub cost_usd: f64,
    pub turns: u32,
    pub entries: usize,
}

pub struct BudgetController {
    store: Arc<MemoryStore>,
    limits: BudgetLimits,
    session_id: String,
    session: Mutex<SessionSpend>,
}

impl BudgetController {
    pub fn new(
        store: Arc<MemoryStore>,
        limits: BudgetLimits,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            limits,
            session_id: session_id.into(),
            session: Mutex::new(SessionSpend::default()),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Append to the ledger, then count toward the session.
    ///
    /// The ledger write comes first so a crash in between never under-counts
    /// the daily total, which is always recomputed from the ledger.
    pub fn record_cost(&self, cost_usd: f64, turns: u32, task: &str) -> Result<()> {
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            bail!("cost must be a non-negative amount, got {cost_usd}");
        }
        let now = Utc::now();
        let event = CostEvent {
            session_id: self.session_id.clone(),
            timestamp: now,
            date: now.with_timezone(&Local).date_naive(),
            cost_usd,
            turns,
            task: task.to_string(),
        };
        self.store.append_cost(&event)?;
        let mut session = self.lock_session()?;
        session.spent_usd += cost_usd;
        session.turns += turns;
        debug!(cost_usd, turns, session_spent = session.spent_usd, "cost recorded");
        Ok(())
    }

    /// Check session spend, daily spend, then turns against the caps.
    pub fn enforce(&self) -> Result<Admission> {
        let daily = self.daily_spent(today())?;
        let session = *self.lock_session()?;
        let admission = check_admission(
            &SpendSnapshot {
                session_spent_usd: session.spent_usd,
                daily_spent_usd: daily,
                session_turns: session.turns,
            },
            &self.limits,
        );
        if !admission.allowed {
            info!(reason = %admission.reason, "budget admission denied");
        }
        Ok(admission)
    }

    /// The smaller of the session and daily headroom, never negative.
    pub fn remaining_usd(&self) -> Result<f64> {
        let summary = self.summary()?;
        Ok(summary
            .session_remaining_usd
            .min(summary.daily_remaining_usd))
    }

    pub fn summary(&self) -> Result<BudgetSummary> {
        let today_events = self.store.costs_on(today())?;
        let daily: f64 = today_events.iter().map(|e| e.cost_usd).sum();
        let session = *self.lock_session()?;
        Ok(BudgetSummary {
            session_id: self.session_id.clone(),
            session_spent_usd: session.spent_usd,
            session_remaining_usd: (self.limits.session_cap_usd - session.spent_usd).max(0.0),
            daily_spent_usd: daily,
            daily_remaining_usd: (self.limits.daily_cap_usd - daily).max(0.0),
            session_turns: session.turns,
            ledger_entries_today: today_events.len(),
        })
    }

    /// Per-day totals across the whole ledger.
    pub fn daily_breakdown(&self) -> Result<BTreeMap<NaiveDate, DailyUsage>> {
        daily_breakdown(&self.store)
    }

    fn daily_spent(&self, date: NaiveDate) -> Result<f64> {
        Ok(self.store.costs_on(date)?.iter().map(|e| e.cost_usd).sum())
    }

    fn lock_session(&self) -> Result<std::sync::MutexGuard<'_, SessionSpend>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("budget session lock poisoned"))
    }
}

pub fn daily_breakdown(store: &MemoryStore) -> Result<BTreeMap<NaiveDate, DailyUsage>> {
    let mut days: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
    for event in store.costs()? {
        let day = days.entry(event.date).or_default();
        day.cost_usd += event.cost_usd;
        day.turns += event.turns;
        day.entries += 1;
    }
    Ok(days)
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
