use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::model::Phase;

#[derive(Parser)]
#[command(name = "ralph")]
#[command(author, version, about = "Deterministic supervisory harness for LLM coding agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root directory
    #[arg(short = 'p', long, global = true, env = "RALPH_PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .ralph/ and seed state and plan
    Init {
        /// Reinitialize even if already initialized
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Drive the iteration loop from the current phase
    Run {
        /// Start from a specific phase
        #[arg(long, value_enum)]
        phase: Option<PhaseArg>,

        /// Iteration cap for this invocation
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Run the discovery phase
    Discover,

    /// Run the planning phase
    Plan,

    /// Run the building phase
    Build,

    /// Run the validation phase
    Validate,

    /// Show orchestrator status
    Status {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// List plan tasks
    Tasks {
        /// Show only pending tasks
        #[arg(long)]
        pending: bool,

        /// Show all tasks including completed
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show session history
    History {
        /// Maximum sessions to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Pause the loop before the next iteration
    Pause,

    /// Resume a paused loop
    Resume,

    /// Block a task directly
    Skip {
        /// Task id to block
        task_id: String,

        /// Reason for skipping
        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },

    /// Queue a context injection for the next iteration
    Inject {
        /// Message to inject
        message: String,

        /// Priority (higher = earlier in the prompt)
        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// Force a session hand-off
    Handoff {
        /// Hand-off reason recorded in the archive
        #[arg(long, default_value = "operator_requested")]
        reason: String,

        /// Session summary for MEMORY.md
        #[arg(long)]
        summary: Option<String>,
    },

    /// Clear the plan and return to planning
    RegeneratePlan {
        /// Drop completed tasks as well
        #[arg(long)]
        discard_completed: bool,
    },

    /// Zero out orchestrator state
    Reset {
        /// Preserve the implementation plan
        #[arg(long)]
        keep_plan: bool,
    },

    /// Delete state files
    Clean {
        /// Also wipe the memory tree
        #[arg(long)]
        memory: bool,

        /// Skip confirmation
        #[arg(long, short = 'f')]
        force: bool,

        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect or rotate memory
    Memory {
        #[command(flatten)]
        action: MemoryAction,
    },
}

#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
pub struct MemoryAction {
    /// Print the active memory rendering
    #[arg(long)]
    pub show: bool,

    /// Print memory file statistics
    #[arg(long)]
    pub stats: bool,

    /// Rotate and clean up memory files
    #[arg(long)]
    pub cleanup: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseArg {
    Discovery,
    Planning,
    Building,
    Validation,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Discovery => Phase::Discovery,
            PhaseArg::Planning => Phase::Planning,
            PhaseArg::Building => Phase::Building,
            PhaseArg::Validation => Phase::Validation,
        }
    }
}
