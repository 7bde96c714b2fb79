//! Tool-use safety validation.
//!
//! A pure pre-call gate over every tool invocation the executor proposes:
//! no I/O, table-driven, trivially unit-testable. Denials are returned to
//! the executor as normal tool failures and never counted against the
//! iteration.

use serde_json::Value;

use crate::config::SafetyConfig;
use crate::model::Phase;

/// Git operations that mutate repository state. Read-only git is the rule;
/// state changes require manual intervention.
pub const BLOCKED_GIT_COMMANDS: &[&str] = &[
    "git commit",
    "git push",
    "git pull",
    "git merge",
    "git rebase",
    "git checkout",
    "git reset",
    "git stash",
    "git cherry-pick",
    "git revert",
    "git branch -d",
    "git branch -D",
];

/// Read-only git operations that are always allowed.
pub const ALLOWED_GIT_COMMANDS: &[&str] = &[
    "git status",
    "git log",
    "git diff",
    "git show",
    "git ls-files",
    "git blame",
    "git branch",
];

/// Package manager commands outside the designated manager.
pub const BLOCKED_PACKAGE_COMMANDS: &[&str] = &[
    "pip install",
    "pip uninstall",
    "pip freeze",
    "python -m pip",
    "pip3 install",
    "pip3 uninstall",
    "python -m venv",
    "python3 -m venv",
    "virtualenv",
    "conda install",
    "conda create",
    "conda activate",
    "poetry install",
    "poetry add",
    "poetry remove",
    "pipenv install",
    "pipenv shell",
];

/// Result of validating a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        reason: String,
        suggestion: Option<String>,
    },
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
            suggestion: None,
        }
    }

    fn deny_with(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Validate one tool invocation against the current phase and safety
/// configuration.
pub fn validate_tool_use(
    tool_name: &str,
    tool_input: &Value,
    current_phase: Phase,
    config: &SafetyConfig,
    phase_tools: &[String],
) -> Decision {
    // Orchestrator-owned tools are available in every phase.
    if tool_name.starts_with("ralph_") {
        return Decision::Allow;
    }

    if !phase_tools.iter().any(|t| t == tool_name) {
        return Decision::deny(format!(
            "tool not allowed in phase {}",
            current_phase.as_str()
        ));
    }

    if tool_name == "Bash" {
        let command = tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        return validate_shell_command(command, config);
    }

    Decision::Allow
}

/// Scan a shell command for blocked prefixes. Matching is substring-based
/// over the lowercased command, so chained commands cannot smuggle a
/// blocked operation past the gate.
pub fn validate_shell_command(command: &str, config: &SafetyConfig) -> Decision {
    let lowered = command.to_lowercase();
    let trimmed = lowered.trim();

    if config.git_read_only {
        for blocked in BLOCKED_GIT_COMMANDS {
            if trimmed.contains(blocked) && !is_allowed_git_override(blocked, config) {
                return Decision::deny_with(
                    "version-control state changes not permitted",
                    format!("blocked operation: {}", blocked),
                );
            }
        }
    }

    for blocked in BLOCKED_PACKAGE_COMMANDS {
        if trimmed.contains(blocked) {
            return Decision::deny_with(
                "use the designated package manager instead",
                package_suggestion(blocked),
            );
        }
    }

    for blocked in &config.blocked_commands {
        let needle = blocked.to_lowercase();
        if !needle.is_empty() && trimmed.contains(needle.as_str()) {
            return Decision::deny_with(
                "command in configured blocklist",
                format!("blocked pattern: {}", blocked),
            );
        }
    }

    Decision::Allow
}

fn is_allowed_git_override(blocked: &str, config: &SafetyConfig) -> bool {
    // `allowed_git_operations` holds bare verbs ("status", "log"). An
    // override applies only to flagless entries: "branch" in the allowlist
    // means listing, never "git branch -D".
    let rest = blocked.trim_start_matches("git ");
    if rest.contains(' ') {
        return false;
    }
    config.allowed_git_operations.iter().any(|allowed| allowed == rest)
}

/// Post-call hook: extract token/cost metadata from a tool result
/// payload when present. Pure, like the pre-call gate.
pub fn usage_from_result(data: &Value) -> Option<(u64, f64)> {
    let tokens = data.get("tokens_used").and_then(|v| v.as_u64());
    let cost = data.get("cost_usd").and_then(|v| v.as_f64());
    if tokens.is_none() && cost.is_none() {
        return None;
    }
    Some((tokens.unwrap_or(0), cost.unwrap_or(0.0)))
}

fn package_suggestion(blocked: &str) -> String {
    if blocked.contains("install") && blocked.starts_with("pip") {
        "use 'uv add <package>' instead".to_string()
    } else if blocked.contains("uninstall") {
        "use 'uv remove <package>' instead".to_string()
    } else if blocked.contains("freeze") {
        "use 'uv lock' instead".to_string()
    } else if blocked.contains("venv") || blocked.contains("virtualenv") {
        "uv manages environments automatically".to_string()
    } else {
        "use uv instead".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> SafetyConfig {
        SafetyConfig::default()
    }

    fn tools_for(phase: Phase) -> Vec<String> {
        crate::phase::default_tools(phase)
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    fn building_tools() -> Vec<String> {
        tools_for(Phase::Building)
    }

    #[test]
    fn test_git_commit_denied() {
        let decision = validate_shell_command("git commit -m x", &config());
        assert_eq!(
            decision,
            Decision::Deny {
                reason: "version-control state changes not permitted".to_string(),
                suggestion: Some("blocked operation: git commit".to_string()),
            }
        );
    }

    #[test]
    fn test_read_only_git_allowed() {
        for cmd in ["git status", "git log --oneline", "git diff HEAD", "git blame src/lib.rs"] {
            assert!(validate_shell_command(cmd, &config()).is_allowed(), "{}", cmd);
        }
    }

    #[test]
    fn test_branch_deletion_denied_but_listing_allowed() {
        assert!(!validate_shell_command("git branch -D feature", &config()).is_allowed());
        assert!(validate_shell_command("git branch", &config()).is_allowed());
    }

    #[test]
    fn test_chained_command_cannot_smuggle() {
        let decision = validate_shell_command("echo ok && git push origin main", &config());
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_package_managers_denied() {
        for cmd in [
            "pip install requests",
            "python -m venv .venv",
            "conda create -n env",
            "poetry add serde",
        ] {
            let decision = validate_shell_command(cmd, &config());
            assert!(
                matches!(&decision, Decision::Deny { reason, .. }
                    if reason == "use the designated package manager instead"),
                "{}",
                cmd
            );
        }
    }

    #[test]
    fn test_configured_blocklist() {
        let decision = validate_shell_command("rm -rf /tmp/x", &config());
        assert!(
            matches!(&decision, Decision::Deny { reason, .. }
                if reason == "command in configured blocklist")
        );
    }

    #[test]
    fn test_case_insensitive_matching() {
        assert!(!validate_shell_command("GIT PUSH origin", &config()).is_allowed());
        assert!(!validate_shell_command("Pip Install x", &config()).is_allowed());
    }

    #[test]
    fn test_phase_allowlist_denial() {
        let tools = tools_for(Phase::Discovery);
        let decision = validate_tool_use("Edit", &json!({}), Phase::Discovery, &config(), &tools);
        assert_eq!(
            decision,
            Decision::deny("tool not allowed in phase discovery")
        );
    }

    #[test]
    fn test_ralph_tools_always_allowed() {
        let tools = tools_for(Phase::Validation);
        let decision = validate_tool_use(
            "ralph_mark_task_complete",
            &json!({"task_id": "A"}),
            Phase::Validation,
            &config(),
            &tools,
        );
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_bash_validated_within_allowed_phase() {
        let decision = validate_tool_use(
            "Bash",
            &json!({"command": "git commit -m oops"}),
            Phase::Building,
            &config(),
            &building_tools(),
        );
        assert!(!decision.is_allowed());

        let decision = validate_tool_use(
            "Bash",
            &json!({"command": "cargo test"}),
            Phase::Building,
            &config(),
            &building_tools(),
        );
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_git_read_only_disabled_allows_commit() {
        let mut cfg = config();
        cfg.git_read_only = false;
        assert!(validate_shell_command("git commit -m x", &cfg).is_allowed());
    }

    #[test]
    fn test_usage_from_result() {
        assert_eq!(
            usage_from_result(&json!({"tokens_used": 1200, "cost_usd": 0.02})),
            Some((1200, 0.02))
        );
        assert_eq!(usage_from_result(&json!({"tokens_used": 500})), Some((500, 0.0)));
        assert_eq!(usage_from_result(&json!({"task_id": "A"})), None);
    }
}
