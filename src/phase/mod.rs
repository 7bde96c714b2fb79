//! Per-phase policy: tool allowlists, turn caps, model selection, prompt
//! builders, and completion predicates.
//!
//! The transition graph itself lives on [`crate::model::Phase`]; this
//! module decides *when* an edge may be taken and what the executor is
//! allowed to do inside each phase.

use crate::config::RalphConfig;
use crate::error::{RalphError, Result};
use crate::model::{ImplementationPlan, Phase, RalphState};

mod prompt;

pub use prompt::{build_system_prompt, build_user_prompt, PromptContext};

/// Built-in tool allowlist per phase. Overridable via
/// `phases.<phase>.allowed_tools` in config.
pub fn default_tools(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::Discovery => &[
            "Read",
            "Glob",
            "Grep",
            "WebSearch",
            "WebFetch",
            "Write",
            "Task",
            "AskUserQuestion",
        ],
        Phase::Planning => &[
            "Read",
            "Glob",
            "Grep",
            "WebSearch",
            "WebFetch",
            "Write",
            "Task",
            "ExitPlanMode",
        ],
        Phase::Building => &[
            "Read",
            "Write",
            "Edit",
            "Bash",
            "BashOutput",
            "KillBash",
            "Glob",
            "Grep",
            "Task",
            "TodoWrite",
            "WebSearch",
            "WebFetch",
            "NotebookEdit",
        ],
        Phase::Validation => &["Read", "Glob", "Grep", "Bash", "Task", "WebFetch"],
    }
}

/// Executor turn cap per phase. Overridable via `phases.<phase>.max_turns`.
pub fn default_max_turns(phase: Phase) -> u32 {
    match phase {
        Phase::Discovery => 50,
        Phase::Planning => 30,
        Phase::Building => 100,
        Phase::Validation => 20,
    }
}

fn settings_for<'a>(config: &'a RalphConfig, phase: Phase) -> &'a crate::config::PhaseSettings {
    match phase {
        Phase::Discovery => &config.phases.discovery,
        Phase::Planning => &config.phases.planning,
        Phase::Building => &config.phases.building,
        Phase::Validation => &config.phases.validation,
    }
}

pub fn allowed_tools(config: &RalphConfig, phase: Phase) -> Vec<String> {
    match &settings_for(config, phase).allowed_tools {
        Some(tools) => tools.clone(),
        None => default_tools(phase).iter().map(|t| t.to_string()).collect(),
    }
}

pub fn max_turns(config: &RalphConfig, phase: Phase) -> u32 {
    settings_for(config, phase)
        .max_turns
        .unwrap_or_else(|| default_max_turns(phase))
}

/// Planning gets the planning model; everything else the primary.
pub fn model_for_phase(config: &RalphConfig, phase: Phase) -> &str {
    match phase {
        Phase::Planning => &config.planning_model,
        _ => &config.primary_model,
    }
}

/// Completion predicate: is the current phase ready to hand over, and to
/// which phase?
pub fn completion_ready(state: &RalphState, plan: &ImplementationPlan) -> Option<Phase> {
    match state.current_phase {
        Phase::Discovery => {
            if state.is_phase_complete(Phase::Discovery) {
                Some(Phase::Planning)
            } else {
                None
            }
        }
        Phase::Planning => {
            if !plan.tasks.is_empty()
                && (state.is_phase_complete(Phase::Planning) || plan.pending_count() > 0)
            {
                Some(Phase::Building)
            } else {
                None
            }
        }
        Phase::Building => {
            if plan.all_settled() {
                Some(Phase::Validation)
            } else {
                None
            }
        }
        // Validation never auto-advances; failures route back to building
        // via the operator or regenerate-plan.
        Phase::Validation => None,
    }
}

/// Validate an explicit (operator or predicate) transition against the
/// graph and the target's entry requirements.
pub fn check_transition(
    from: Phase,
    to: Phase,
    plan: &ImplementationPlan,
    forced: bool,
) -> Result<()> {
    if forced {
        // Operator commands may jump anywhere (reset, regenerate-plan).
        return Ok(());
    }
    if !from.can_transition_to(to) {
        return Err(RalphError::InvalidPhaseTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if to == Phase::Building && from == Phase::Planning && plan.tasks.is_empty() {
        return Err(RalphError::InvalidPlan(
            "cannot enter building with an empty plan".to_string(),
        ));
    }
    if to == Phase::Validation && from == Phase::Building && !plan.all_settled() {
        return Err(RalphError::InvalidPhaseTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}
