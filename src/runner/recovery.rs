//! Failure-to-action mapping.
//!
//! The recovery table is fixed: cost breaches need a human, stagnation
//! gets a fresh context window, failures below the cap retry, and a task
//! that keeps failing is skipped.

use std::fmt;

use crate::model::{ImplementationPlan, RalphState};
use crate::scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    SkipTask,
    Handoff,
    ManualIntervention,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::SkipTask => "skip_task",
            RecoveryAction::Handoff => "handoff",
            RecoveryAction::ManualIntervention => "manual_intervention",
        };
        write!(f, "{}", s)
    }
}

/// Select the recovery action for a failed iteration. `max_retries` is
/// the configured per-task attempt allowance before a skip.
pub fn determine_recovery_action(
    state: &RalphState,
    plan: &ImplementationPlan,
    error: &str,
    max_retries: u32,
) -> RecoveryAction {
    let cb = &state.circuit_breaker;

    if error.contains("budget exceeded") || state.total_cost_usd >= cb.max_cost_usd {
        return RecoveryAction::ManualIntervention;
    }

    if cb.stagnation_count >= cb.max_stagnation_iterations {
        return RecoveryAction::Handoff;
    }

    if cb.failure_count < cb.max_consecutive_failures {
        return RecoveryAction::Retry;
    }

    let retrying_task_exhausted = scheduler::next_task(plan)
        .map(|t| t.retry_count + 1 >= max_retries)
        .unwrap_or(false);
    if retrying_task_exhausted {
        return RecoveryAction::SkipTask;
    }

    RecoveryAction::ManualIntervention
}
