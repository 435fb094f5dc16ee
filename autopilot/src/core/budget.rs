//! Spend and turn admission checks.

use serde::{Deserialize, Serialize};

use crate::core::types::Admission;

/// Caps enforced by the budget controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub session_cap_usd: f64,
    pub daily_cap_usd: f64,
    pub max_turns_per_task: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            session_cap_usd: 10.0,
            daily_cap_usd: 50.0,
            max_turns_per_task: 200,
        }
    }
}

/// Spend observed at the moment of the check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendSnapshot {
    pub session_spent_usd: f64,
    pub daily_spent_usd: f64,
    pub session_turns: u32,
}

/// Check, in order: session spend, daily spend, session turns.
///
/// The first violated cap determines the reason.
pub fn check_admission(spend: &SpendSnapshot, limits: &BudgetLimits) -> Admission {
    if spend.session_spent_usd >= limits.session_cap_usd {
        return Admission::deny(format!(
            "Session budget exhausted: ${:.2} spent of ${:.2} cap",
            spend.session_spent_usd, limits.session_cap_usd
        ));
    }
    if spend.daily_spent_usd >= limits.daily_cap_usd {
        return Admission::deny(format!(
            "Daily budget exhausted: ${:.2} spent of ${:.2} cap",
            spend.daily_spent_usd, limits.daily_cap_usd
        ));
    }
    if spend.session_turns >= limits.max_turns_per_task {
        return Admission::deny(format!(
            "Turn limit reached: {} of {} turns",
            spend.session_turns, limits.max_turns_per_task
        ));
    }
    Admission::allow(format!(
        "Within budget: session ${:.2}/${:.2}, daily ${:.2}/${:.2}, turns {}/{}",
        spend.session_spent_usd,
        limits.session_cap_usd,
        spend.daily_spent_usd,
        limits.daily_cap_usd,
        spend.session_turns,
        limits.max_turns_per_task
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(session: f64, daily: f64, turns: u32) -> SpendSnapshot {
        SpendSnapshot {
            session_spent_usd: session,
            daily_spent_usd: daily,
            session_turns: turns,
        }
    }

    #[test]
    fn session_cap_is_checked_first() {
        let limits = BudgetLimits::default();
        let admission = check_admission(&spend(10.0, 100.0, 500), &limits);
        assert!(!admission.allowed);
        assert!(admission.reason.starts_with("Session"));
    }

    #[test]
    fn daily_cap_denies_when_session_is_fine() {
        let limits = BudgetLimits::default();
        let admission = check_admission(&spend(1.0, 50.0, 0), &limits);
        assert!(!admission.allowed);
        assert!(admission.reason.starts_with("Daily"));
    }

    #[test]
    fn turn_cap_is_checked_last() {
        let limits = BudgetLimits::default();
        let admission = check_admission(&spend(1.0, 1.0, 200), &limits);
        assert!(!admission.allowed);
        assert!(admission.reason.starts_with("Turn"));
    }

    #[test]
    fn all_checks_pass_under_caps() {
        let admission = check_admission(&spend(9.99, 49.99, 199), &BudgetLimits::default());
        assert!(admission.allowed);
    }
}
