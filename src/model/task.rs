use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};

const DEFAULT_ESTIMATED_TOKENS: u64 = 30_000;

/// Task completion states. Complete is terminal; Blocked can be released
/// back to Pending via an explicit unblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// A single unit of work within an implementation plan, sized for one
/// context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: i64,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub verification_criteria: Vec<String>,

    #[serde(default)]
    pub blockers: Vec<String>,

    #[serde(default)]
    pub spec_files: Vec<String>,

    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens: u64,

    #[serde(default)]
    pub actual_tokens_used: Option<u64>,

    #[serde(default)]
    pub completion_notes: Option<String>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_estimated_tokens() -> u64 {
    DEFAULT_ESTIMATED_TOKENS
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            verification_criteria: Vec::new(),
            blockers: Vec::new(),
            spec_files: Vec::new(),
            estimated_tokens: DEFAULT_ESTIMATED_TOKENS,
            actual_tokens_used: None,
            completion_notes: None,
            completed_at: None,
            retry_count: 0,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_verification_criteria(mut self, criteria: Vec<String>) -> Self {
        self.verification_criteria = criteria;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn with_spec_files(mut self, files: Vec<String>) -> Self {
        self.spec_files = files;
        self
    }

    /// A task is runnable when pending and every dependency is complete.
    pub fn is_runnable(&self, completed: &BTreeSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    pub fn mark_in_progress(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::InProgress;
                Ok(())
            }
            other => Err(self.invalid_transition(other, TaskStatus::InProgress)),
        }
    }

    pub fn mark_complete(&mut self, notes: Option<String>, tokens_used: Option<u64>) -> Result<()> {
        match self.status {
            TaskStatus::Complete => {
                Err(self.invalid_transition(TaskStatus::Complete, TaskStatus::Complete))
            }
            _ => {
                self.status = TaskStatus::Complete;
                self.completion_notes = notes;
                self.actual_tokens_used = tokens_used;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    pub fn mark_blocked(&mut self, reason: impl Into<String>) -> Result<()> {
        match self.status {
            TaskStatus::Complete => {
                Err(self.invalid_transition(TaskStatus::Complete, TaskStatus::Blocked))
            }
            _ => {
                let reason = reason.into();
                self.status = TaskStatus::Blocked;
                self.completion_notes = Some(format!("BLOCKED: {}", reason));
                self.blockers.push(reason);
                Ok(())
            }
        }
    }

    /// Release a blocked task back to pending for another attempt.
    pub fn unblock(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Blocked => {
                self.status = TaskStatus::Pending;
                self.completion_notes = None;
                Ok(())
            }
            other => Err(self.invalid_transition(other, TaskStatus::Pending)),
        }
    }

    /// Record a failed attempt. The task returns to pending; the scheduler
    /// blocks it once the retry cap is reached.
    pub fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        if self.status == TaskStatus::InProgress {
            self.status = TaskStatus::Pending;
        }
        self.retry_count
    }

    fn invalid_transition(&self, from: TaskStatus, to: TaskStatus) -> RalphError {
        RalphError::InvalidTransition {
            task_id: self.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_pending_to_complete() {
        let mut task = Task::new("T001", "Implement login", 1);
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_in_progress().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        task.mark_complete(Some("done".to_string()), Some(12_000))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.completed_at.is_some());
        assert_eq!(task.actual_tokens_used, Some(12_000));
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut task = Task::new("T001", "x", 1);
        task.mark_complete(None, None).unwrap();

        assert!(task.mark_complete(None, None).is_err());
        assert!(task.mark_blocked("late").is_err());
        assert!(task.mark_in_progress().is_err());
    }

    #[test]
    fn test_blocked_then_unblock() {
        let mut task = Task::new("T001", "x", 1);
        task.mark_blocked("missing dependency").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blockers, vec!["missing dependency".to_string()]);
        assert_eq!(
            task.completion_notes.as_deref(),
            Some("BLOCKED: missing dependency")
        );

        task.unblock().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_in_progress_requires_pending() {
        let mut task = Task::new("T001", "x", 1);
        task.mark_in_progress().unwrap();
        assert!(task.mark_in_progress().is_err());
    }

    #[test]
    fn test_increment_retry_demotes_in_progress() {
        let mut task = Task::new("T001", "x", 1);
        task.mark_in_progress().unwrap();
        assert_eq!(task.increment_retry(), 1);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_runnable_requires_completed_deps() {
        let task =
            Task::new("T002", "x", 1).with_dependencies(vec!["T001".to_string()]);

        let mut completed = BTreeSet::new();
        assert!(!task.is_runnable(&completed));

        completed.insert("T001".to_string());
        assert!(task.is_runnable(&completed));
    }
}
