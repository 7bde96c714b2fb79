//! Backpressure command execution.
//!
//! Runs user-defined verification commands (tests, lint, type-check)
//! strictly one at a time, each with a timeout, capturing output whole
//! before the next begins. The commands themselves are configuration;
//! the sequencing guarantee is the orchestrator's.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::BuildConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Test,
    Lint,
    TypeCheck,
    Custom,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::Test => "test",
            CheckKind::Lint => "lint",
            CheckKind::TypeCheck => "typecheck",
            CheckKind::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub command: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// Aggregate report over a backpressure run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub summary: String,
}

impl VerificationReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        // No checks run means nothing was verified.
        let passed = !checks.is_empty() && checks.iter().all(|c| c.passed);
        let failed = checks.iter().filter(|c| !c.passed).count();
        let summary = if checks.is_empty() {
            "No checks performed".to_string()
        } else if passed {
            format!("All {} checks passed", checks.len())
        } else {
            format!("{}/{} checks failed", failed, checks.len())
        };
        Self {
            passed,
            checks,
            summary,
        }
    }

    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

fn classify(command: &str, config: &BuildConfig) -> CheckKind {
    if command == config.test_command {
        CheckKind::Test
    } else if command == config.lint_command {
        CheckKind::Lint
    } else if command == config.typecheck_command {
        CheckKind::TypeCheck
    } else {
        CheckKind::Custom
    }
}

/// Run one shell command with a timeout, capturing stdout and stderr
/// whole. The child is killed on timeout.
pub async fn run_command(
    command: &str,
    kind: CheckKind,
    cwd: &Path,
    timeout: Duration,
) -> Result<CheckResult> {
    debug!(command, "Running verification command");
    let started = Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.stderr.is_empty() {
                text.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            Ok(CheckResult {
                kind,
                command: command.to_string(),
                passed: output.status.success(),
                exit_code: output.status.code(),
                timed_out: false,
                output: text,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Ok(CheckResult {
            kind,
            command: command.to_string(),
            passed: false,
            exit_code: None,
            timed_out: false,
            output: format!("failed to spawn: {}", e),
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "Verification command timed out");
            Ok(CheckResult {
                kind,
                command: command.to_string(),
                passed: false,
                exit_code: None,
                timed_out: true,
                output: format!("timed out after {}s", timeout.as_secs()),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Run every configured backpressure command sequentially. Output from
/// one command is fully captured before the next starts.
pub async fn run_backpressure(config: &BuildConfig, cwd: &Path) -> Result<VerificationReport> {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    let mut checks = Vec::with_capacity(config.backpressure.len());

    for command in &config.backpressure {
        let kind = classify(command, config);
        let result = run_command(command, kind, cwd, timeout).await?;
        let passed = result.passed;
        checks.push(result);
        if !passed {
            debug!(command, "Check failed; remaining checks still run");
        }
    }

    Ok(VerificationReport::new(checks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_config(backpressure: Vec<&str>) -> BuildConfig {
        BuildConfig {
            backpressure: backpressure.into_iter().map(|s| s.to_string()).collect(),
            command_timeout_secs: 5,
            ..BuildConfig::default()
        }
    }

    #[tokio::test]
    async fn test_passing_command() {
        let result = run_command(
            "true",
            CheckKind::Custom,
            Path::new("."),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_failing_command_captures_output() {
        let result = run_command(
            "echo broken && exit 3",
            CheckKind::Custom,
            Path::new("."),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("broken"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let result = run_command(
            "sleep 30",
            CheckKind::Custom,
            Path::new("."),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(!result.passed);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_backpressure_runs_all_sequentially() {
        let config = build_config(vec!["echo one", "false", "echo three"]);
        let report = run_backpressure(&config, Path::new(".")).await.unwrap();

        assert!(!report.passed);
        assert_eq!(report.checks.len(), 3);
        assert!(report.checks[0].passed);
        assert!(!report.checks[1].passed);
        assert!(report.checks[2].passed);
        assert_eq!(report.failed_checks().len(), 1);
        assert_eq!(report.summary, "1/3 checks failed");
    }

    #[tokio::test]
    async fn test_empty_backpressure_does_not_pass() {
        let config = build_config(vec![]);
        let report = run_backpressure(&config, Path::new(".")).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.summary, "No checks performed");
    }
}
