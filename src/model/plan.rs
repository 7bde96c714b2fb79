use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};

use super::task::{Task, TaskStatus};

/// Prioritized task list with dependency tracking, persisted to
/// `.ralph/implementation_plan.json`. Tasks are kept in insertion order;
/// selection order is the scheduler's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    #[serde(default)]
    pub tasks: Vec<Task>,

    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ImplementationPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ImplementationPlan {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            tasks: Vec::new(),
            created_at: now,
            last_modified: now,
            extra: BTreeMap::new(),
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    fn require_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        match self.tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => Ok(task),
            None => Err(RalphError::UnknownTask(task_id.to_string())),
        }
    }

    /// Insert a task, enforcing id uniqueness, dependency existence, and
    /// acyclicity of the dependency graph.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.task(&task.id).is_some() {
            return Err(RalphError::DuplicateId(task.id));
        }
        for dep in &task.dependencies {
            if *dep != task.id && self.task(dep).is_none() {
                return Err(RalphError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if self.would_cycle(&task) {
            return Err(RalphError::CycleIntroduced(task.id));
        }

        self.tasks.push(task);
        self.touch();
        Ok(())
    }

    /// DFS reachability over the graph including the candidate: a cycle
    /// exists iff the candidate is reachable from one of its dependencies.
    fn would_cycle(&self, candidate: &Task) -> bool {
        let mut adjacency: BTreeMap<&str, &[String]> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
            .collect();
        adjacency.insert(candidate.id.as_str(), candidate.dependencies.as_slice());

        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = candidate
            .dependencies
            .iter()
            .map(|d| d.as_str())
            .collect();

        while let Some(node) = stack.pop() {
            if node == candidate.id {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(deps) = adjacency.get(node) {
                stack.extend(deps.iter().map(|d| d.as_str()));
            }
        }
        false
    }

    /// Check structural integrity of an already-loaded plan. Violations
    /// here mean the on-disk plan was edited out from under us.
    pub fn validate(&self) -> Result<()> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(RalphError::InvalidPlan(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if self.task(dep).is_none() {
                    return Err(RalphError::InvalidPlan(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
            if self.reaches(task.id.as_str(), &task.dependencies) {
                return Err(RalphError::InvalidPlan(format!(
                    "dependency cycle through task {}",
                    task.id
                )));
            }
        }
        Ok(())
    }

    fn reaches(&self, target: &str, from: &[String]) -> bool {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = from.iter().map(|d| d.as_str()).collect();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(task) = self.task(node) {
                stack.extend(task.dependencies.iter().map(|d| d.as_str()));
            }
        }
        false
    }

    pub fn completed_ids(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Tasks with status pending whose every dependency is complete.
    pub fn runnable_tasks(&self) -> Vec<&Task> {
        let completed = self.completed_ids();
        self.tasks
            .iter()
            .filter(|t| t.is_runnable(&completed))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.count_status(TaskStatus::Pending)
    }

    pub fn complete_count(&self) -> usize {
        self.count_status(TaskStatus::Complete)
    }

    pub fn blocked_count(&self) -> usize {
        self.count_status(TaskStatus::Blocked)
    }

    pub fn in_progress_count(&self) -> usize {
        self.count_status(TaskStatus::InProgress)
    }

    fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Fraction of tasks complete, in [0.0, 1.0].
    pub fn completion_percentage(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        self.complete_count() as f64 / self.tasks.len() as f64
    }

    /// True when every task is complete or blocked. The building phase may
    /// only hand over to validation once this holds.
    pub fn all_settled(&self) -> bool {
        !self.tasks.is_empty() && self.pending_count() == 0 && self.in_progress_count() == 0
    }

    /// Demote any in-progress task back to pending. Called at session
    /// start: the previous session could not confirm completion.
    pub fn reset_stale_in_progress(&mut self) -> usize {
        let mut count = 0;
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                count += 1;
            }
        }
        if count > 0 {
            self.touch();
        }
        count
    }

    pub fn mark_task_in_progress(&mut self, task_id: &str) -> Result<()> {
        self.require_mut(task_id)?.mark_in_progress()?;
        self.touch();
        Ok(())
    }

    pub fn mark_task_complete(
        &mut self,
        task_id: &str,
        notes: Option<String>,
        tokens_used: Option<u64>,
    ) -> Result<()> {
        self.require_mut(task_id)?.mark_complete(notes, tokens_used)?;
        self.touch();
        Ok(())
    }

    pub fn mark_task_blocked(&mut self, task_id: &str, reason: &str) -> Result<()> {
        self.require_mut(task_id)?.mark_blocked(reason)?;
        self.touch();
        Ok(())
    }

    pub fn unblock_task(&mut self, task_id: &str) -> Result<()> {
        self.require_mut(task_id)?.unblock()?;
        self.touch();
        Ok(())
    }

    pub fn increment_retry(&mut self, task_id: &str) -> Result<u32> {
        let count = self.require_mut(task_id)?.increment_retry();
        self.touch();
        Ok(count)
    }

    /// Drop tasks for `regenerate-plan`. With `keep_completed`, completed
    /// tasks survive so dependents can still resolve; their dependencies on
    /// dropped tasks are pruned by virtue of re-planning from scratch.
    pub fn clear_tasks(&mut self, keep_completed: bool) {
        if keep_completed {
            self.tasks.retain(|t| t.status == TaskStatus::Complete);
        } else {
            self.tasks.clear();
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}
