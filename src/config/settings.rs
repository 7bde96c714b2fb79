use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{RalphError, Result};

use super::model::{DEFAULT_CONTEXT_WINDOW, DEFAULT_MODEL, PLANNING_MODEL};

/// Cost ceilings in USD. A breach is recorded as an iteration failure
/// and fed to the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostLimits {
    pub per_iteration: f64,
    pub per_session: f64,
    pub total: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            per_iteration: 2.0,
            per_session: 50.0,
            total: 200.0,
        }
    }
}

/// Context window management settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub total_capacity: u64,
    pub safety_margin: f64,
    pub max_active_memory_chars: usize,
    pub max_iteration_files: usize,
    pub max_session_files: usize,
    pub archive_retention_days: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            total_capacity: DEFAULT_CONTEXT_WINDOW,
            safety_margin: 0.20,
            max_active_memory_chars: 8000,
            max_iteration_files: 20,
            max_session_files: 10,
            archive_retention_days: 30,
        }
    }
}

/// Limits consumed by the memory subsystem, derived from [`ContextConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_active_memory_chars: usize,
    pub max_iteration_files: usize,
    pub max_session_files: usize,
    pub archive_retention_days: i64,
}

impl From<&ContextConfig> for MemoryLimits {
    fn from(ctx: &ContextConfig) -> Self {
        Self {
            max_active_memory_chars: ctx.max_active_memory_chars,
            max_iteration_files: ctx.max_iteration_files,
            max_session_files: ctx.max_session_files,
            archive_retention_days: ctx.archive_retention_days,
        }
    }
}

/// Safety and sandboxing settings fed to the tool validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub blocked_commands: Vec<String>,
    pub git_read_only: bool,
    pub allowed_git_operations: Vec<String>,
    pub max_retries: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_commands: vec!["rm -rf".to_string(), "sudo ".to_string()],
            git_read_only: true,
            allowed_git_operations: vec![
                "status".to_string(),
                "log".to_string(),
                "diff".to_string(),
                "show".to_string(),
                "ls-files".to_string(),
                "blame".to_string(),
                "branch".to_string(),
            ],
            max_retries: 3,
        }
    }
}

/// Verification command configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub tool: String,
    pub test_command: String,
    pub lint_command: String,
    pub typecheck_command: String,
    pub backpressure: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: "uv".to_string(),
            test_command: "uv run pytest".to_string(),
            lint_command: "uv run ruff check .".to_string(),
            typecheck_command: "uv run mypy .".to_string(),
            backpressure: vec![
                "uv run pytest".to_string(),
                "uv run mypy .".to_string(),
                "uv run ruff check .".to_string(),
            ],
            command_timeout_secs: 300,
        }
    }
}

/// Per-phase settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PhaseSettings {
    pub allowed_tools: Option<Vec<String>>,
    pub max_turns: Option<u32>,
    pub require_human_approval: bool,
}

/// Per-phase settings, nested under `phases:` in config.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasesConfig {
    pub discovery: PhaseSettings,
    pub planning: PhaseSettings,
    pub building: PhaseSettings,
    pub validation: PhaseSettings,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            discovery: PhaseSettings::default(),
            planning: PhaseSettings::default(),
            building: PhaseSettings::default(),
            validation: PhaseSettings {
                require_human_approval: true,
                ..PhaseSettings::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

/// Complete ralph configuration, loaded from `.ralph/config.yaml`.
/// The core reads this file and never writes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphConfig {
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub context: ContextConfig,
    pub safety: SafetyConfig,
    pub cost_limits: CostLimits,
    pub phases: PhasesConfig,

    pub primary_model: String,
    pub planning_model: String,

    pub max_iterations: u32,
    pub circuit_breaker_failures: u32,
    pub circuit_breaker_stagnation: u32,
    pub max_cost_usd: f64,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            build: BuildConfig::default(),
            context: ContextConfig::default(),
            safety: SafetyConfig::default(),
            cost_limits: CostLimits::default(),
            phases: PhasesConfig::default(),
            primary_model: DEFAULT_MODEL.to_string(),
            planning_model: PLANNING_MODEL.to_string(),
            max_iterations: 100,
            circuit_breaker_failures: 3,
            circuit_breaker_stagnation: 5,
            max_cost_usd: 100.0,
        }
    }
}

impl RalphConfig {
    /// Load configuration from `.ralph/config.yaml`, falling back to
    /// defaults when the file is absent. Environment variables override
    /// file values.
    pub async fn load(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".ralph").join("config.yaml");
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .map_err(|e| RalphError::from_io(e, &config_path))?;
            serde_yaml_bw::from_str(&content)
                .map_err(|e| RalphError::Config(format!("{}: {}", config_path.display(), e)))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Write a default configuration file for `init`. Only done when the
    /// file does not already exist; the core never overwrites user config.
    pub async fn write_default(project_root: &Path, project_name: &str) -> Result<PathBuf> {
        let config_path = project_root.join(".ralph").join("config.yaml");
        if config_path.exists() {
            return Ok(config_path);
        }
        let mut config = Self::default();
        config.project.name = project_name.to_string();
        let content = serde_yaml_bw::to_string(&config)?;
        fs::write(&config_path, content)
            .await
            .map_err(|e| RalphError::from_io(e, &config_path))?;
        Ok(config_path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("RALPH_PRIMARY_MODEL") {
            self.primary_model = model;
        }
        if let Ok(model) = std::env::var("RALPH_PLANNING_MODEL") {
            self.planning_model = model;
        }
        if let Ok(val) = std::env::var("RALPH_MAX_ITERATIONS") {
            if let Ok(n) = val.parse() {
                self.max_iterations = n;
            }
        }
        if let Ok(val) = std::env::var("RALPH_MAX_COST_USD") {
            if let Ok(n) = val.parse() {
                self.cost_limits.total = n;
            }
        }
        if let Ok(val) = std::env::var("RALPH_CIRCUIT_BREAKER_FAILURES") {
            if let Ok(n) = val.parse() {
                self.circuit_breaker_failures = n;
            }
        }
        if let Ok(val) = std::env::var("RALPH_CIRCUIT_BREAKER_STAGNATION") {
            if let Ok(n) = val.parse() {
                self.circuit_breaker_stagnation = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.max_iterations == 0 {
            errors.push("max_iterations must be greater than 0");
        }
        if self.circuit_breaker_failures == 0 {
            errors.push("circuit_breaker_failures must be greater than 0");
        }
        if self.circuit_breaker_stagnation == 0 {
            errors.push("circuit_breaker_stagnation must be greater than 0");
        }
        if !(0.0..1.0).contains(&self.context.safety_margin) {
            errors.push("context.safety_margin must be in [0.0, 1.0)");
        }
        if self.context.total_capacity == 0 {
            errors.push("context.total_capacity must be greater than 0");
        }
        if self.cost_limits.per_iteration <= 0.0
            || self.cost_limits.per_session <= 0.0
            || self.cost_limits.total <= 0.0
        {
            errors.push("cost limits must be positive");
        }
        if self.cost_limits.per_iteration > self.cost_limits.per_session
            || self.cost_limits.per_session > self.cost_limits.total
        {
            errors.push("cost limits must be ordered: per_iteration <= per_session <= total");
        }
        if self.primary_model.is_empty() || self.planning_model.is_empty() {
            errors.push("model names must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RalphError::Config(errors.join("; ")))
        }
    }
}

/// Resolved on-disk layout under the project root. All orchestrator-owned
/// state lives under `.ralph/`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub state_file: PathBuf,
    pub plan_file: PathBuf,
    pub injections_file: PathBuf,
    pub config_file: PathBuf,
    pub progress_file: PathBuf,
    pub memory_file: PathBuf,
    pub session_history_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub lock_file: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            state_file: ralph_dir.join("state.json"),
            plan_file: ralph_dir.join("implementation_plan.json"),
            injections_file: ralph_dir.join("injections.json"),
            config_file: ralph_dir.join("config.yaml"),
            progress_file: ralph_dir.join("progress.txt"),
            memory_file: ralph_dir.join("MEMORY.md"),
            session_history_dir: ralph_dir.join("session_history"),
            memory_dir: ralph_dir.join("memory"),
            lock_file: ralph_dir.join("lock"),
            ralph_dir,
            root,
        }
    }

    pub fn sessions_log(&self) -> PathBuf {
        self.session_history_dir.join("sessions.jsonl")
    }

    pub fn memory_subdir(&self, name: &str) -> PathBuf {
        self.memory_dir.join(name)
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.ralph_dir,
            &self.session_history_dir,
            &self.memory_subdir("phases"),
            &self.memory_subdir("iterations"),
            &self.memory_subdir("sessions"),
            &self.memory_subdir("archive"),
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| RalphError::from_io(e, dir))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(RalphConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_safety_margin_rejected() {
        let mut config = RalphConfig::default();
        config.context.safety_margin = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unordered_cost_limits_rejected() {
        let mut config = RalphConfig::default();
        config.cost_limits.per_iteration = 500.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_layout() {
        let paths = ProjectPaths::new("/tmp/proj");
        assert_eq!(
            paths.state_file,
            PathBuf::from("/tmp/proj/.ralph/state.json")
        );
        assert_eq!(
            paths.sessions_log(),
            PathBuf::from("/tmp/proj/.ralph/session_history/sessions.jsonl")
        );
    }
}
