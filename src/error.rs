use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RalphError {
    #[error("State file not found: {0}")]
    StateNotFound(PathBuf),

    #[error("Corrupted state in {path}: {message}. Run 'ralph reset' to recover.")]
    CorruptedState { path: PathBuf, message: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Disk full while writing {0}")]
    DiskFull(PathBuf),

    #[error("Project not initialized. Run 'ralph init' first.")]
    NotInitialized,

    #[error("Project already initialized. Use --force to reinitialize.")]
    AlreadyInitialized,

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    #[error("Unknown dependency {dependency} for task {task_id}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Adding task {0} would introduce a dependency cycle")]
    CycleIntroduced(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Iteration budget exceeded: ${spent:.2} >= ${limit:.2}")]
    IterationBudgetExceeded { spent: f64, limit: f64 },

    #[error("Session budget exceeded: ${spent:.2} >= ${limit:.2}")]
    SessionBudgetExceeded { spent: f64, limit: f64 },

    #[error("Total budget exceeded: ${spent:.2} >= ${limit:.2}")]
    TotalBudgetExceeded { spent: f64, limit: f64 },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Iteration cancelled")]
    Cancelled,

    #[error(
        "Another orchestrator is already running on this project (PID: {pid}, started {started_at})"
    )]
    LockHeld { pid: u32, started_at: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid tool call '{tool}': {message}")]
    InvalidToolCall { tool: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),
}

impl RalphError {
    /// Classify an io error against the path it touched.
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        // ENOSPC has no stable ErrorKind mapping on all platforms
        if err.raw_os_error() == Some(28) {
            return Self::DiskFull(path.to_path_buf());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::StateNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// Budget errors are routed to the circuit breaker rather than the CLI.
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            Self::IterationBudgetExceeded { .. }
                | Self::SessionBudgetExceeded { .. }
                | Self::TotalBudgetExceeded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RalphError>;
