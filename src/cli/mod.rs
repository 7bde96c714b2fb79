//! Command-line interface definitions.
//!
//! Provides CLI structure and output formatting:
//! - `Cli`, `Commands`: argument definitions via clap
//! - `Display`: formatted terminal output with colors and panels
//! - exit-code mapping for the `run` family of commands

mod commands;
mod display;

pub use commands::{Cli, Commands, MemoryAction, PhaseArg};
pub use display::Display;

use crate::runner::{LoopResult, LoopStatus};

/// Normative exit codes.
pub mod exit_codes {
    pub const OK: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const BAD_USAGE: u8 = 2;
    pub const NOT_INITIALIZED: u8 = 3;
    pub const CIRCUIT_BREAKER_HALT: u8 = 4;
    pub const ITERATION_LIMIT: u8 = 5;
}

/// Map a loop result to the exit code contract.
pub fn exit_code_for(result: &LoopResult) -> u8 {
    match result.status {
        LoopStatus::Completed | LoopStatus::Paused => exit_codes::OK,
        LoopStatus::Failed => exit_codes::GENERAL_ERROR,
        LoopStatus::Halted => match result.halt_reason.as_deref() {
            Some(reason) if reason.starts_with("max_iterations:") => exit_codes::ITERATION_LIMIT,
            Some(_) => exit_codes::CIRCUIT_BREAKER_HALT,
            None => exit_codes::GENERAL_ERROR,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Phase;

    fn result(status: LoopStatus, halt_reason: Option<&str>) -> LoopResult {
        LoopResult {
            status,
            iterations_completed: 1,
            tasks_completed: 0,
            total_cost_usd: 0.0,
            total_tokens_used: 0,
            final_phase: Phase::Building,
            halt_reason: halt_reason.map(|s| s.to_string()),
            error: None,
            session_count: 1,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&result(LoopStatus::Completed, None)), 0);
        assert_eq!(
            exit_code_for(&result(LoopStatus::Halted, Some("stagnation:5"))),
            4
        );
        assert_eq!(
            exit_code_for(&result(LoopStatus::Halted, Some("max_iterations:100"))),
            5
        );
        assert_eq!(exit_code_for(&result(LoopStatus::Failed, None)), 1);
    }
}
