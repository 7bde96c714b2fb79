//! Deterministic task selection.
//!
//! The scheduler, not the LLM, decides which task runs next: runnable
//! tasks sorted ascending by `(priority, id)`, id being the stable
//! tie-break. Tasks that hit the retry cap are blocked before selection.

use tracing::info;

use crate::error::Result;
use crate::model::{ImplementationPlan, Task, TaskStatus};

/// Retries allowed before a task is taken out of rotation.
pub const MAX_TASK_RETRIES: u32 = 3;

const MAX_RETRIES_REASON: &str = "max retries exceeded";

/// Select the next runnable task. Returns `None` when nothing is runnable
/// (all complete, blocked, or waiting on dependencies).
pub fn next_task(plan: &ImplementationPlan) -> Option<&Task> {
    plan.runnable_tasks()
        .into_iter()
        .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
}

/// Block every non-complete task that reached the retry cap. Returns the
/// ids that were blocked. Called before each selection so that a task
/// failing its third attempt is skipped from then on.
pub fn enforce_retry_cap(plan: &mut ImplementationPlan) -> Result<Vec<String>> {
    let over_cap: Vec<String> = plan
        .tasks
        .iter()
        .filter(|t| {
            t.retry_count >= MAX_TASK_RETRIES
                && t.status != TaskStatus::Complete
                && t.status != TaskStatus::Blocked
        })
        .map(|t| t.id.clone())
        .collect();

    for id in &over_cap {
        plan.mark_task_blocked(id, MAX_RETRIES_REASON)?;
        info!(task_id = %id, "Task blocked after exhausting retries");
    }
    Ok(over_cap)
}

/// Record an iteration failure against a task: bump its retry count and
/// block it once the cap is reached.
pub fn record_task_failure(plan: &mut ImplementationPlan, task_id: &str) -> Result<u32> {
    let count = plan.increment_retry(task_id)?;
    if count >= MAX_TASK_RETRIES {
        plan.mark_task_blocked(task_id, MAX_RETRIES_REASON)?;
        info!(task_id = %task_id, retries = count, "Task blocked after exhausting retries");
    }
    Ok(count)
}

/// Session-start recovery: demote stale in-progress tasks and validate the
/// plan's structural invariants before scheduling from it.
pub fn recover_at_session_start(plan: &mut ImplementationPlan) -> Result<usize> {
    plan.validate()?;
    Ok(plan.reset_stale_in_progress())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn plan_with(ids: &[(&str, i64, &[&str])]) -> ImplementationPlan {
        let mut plan = ImplementationPlan::new();
        for (id, priority, deps) in ids {
            let task = Task::new(*id, format!("task {}", id), *priority)
                .with_dependencies(deps.iter().map(|d| d.to_string()).collect());
            plan.add_task(task).unwrap();
        }
        plan
    }

    #[test]
    fn test_next_task_empty_plan() {
        let plan = ImplementationPlan::new();
        assert!(next_task(&plan).is_none());
    }

    #[test]
    fn test_priority_order() {
        let plan = plan_with(&[("B", 2, &[]), ("A", 1, &[])]);
        assert_eq!(next_task(&plan).unwrap().id, "A");
    }

    #[test]
    fn test_id_tie_break() {
        let plan = plan_with(&[("Y", 1, &[]), ("X", 1, &[])]);
        assert_eq!(next_task(&plan).unwrap().id, "X");
    }

    #[test]
    fn test_dependency_chain() {
        let mut plan = plan_with(&[("A", 1, &[]), ("B", 2, &["A"])]);
        assert_eq!(next_task(&plan).unwrap().id, "A");

        plan.mark_task_complete("A", None, None).unwrap();
        assert_eq!(next_task(&plan).unwrap().id, "B");

        plan.mark_task_complete("B", None, None).unwrap();
        assert!(next_task(&plan).is_none());
    }

    #[test]
    fn test_blocked_task_not_selected() {
        let mut plan = plan_with(&[("A", 1, &[]), ("B", 2, &[])]);
        plan.mark_task_blocked("A", "stuck").unwrap();
        assert_eq!(next_task(&plan).unwrap().id, "B");
    }

    #[test]
    fn test_record_failure_blocks_at_cap() {
        let mut plan = plan_with(&[("A", 1, &[])]);
        assert_eq!(record_task_failure(&mut plan, "A").unwrap(), 1);
        assert_eq!(record_task_failure(&mut plan, "A").unwrap(), 2);
        assert_eq!(plan.task("A").unwrap().status, TaskStatus::Pending);

        assert_eq!(record_task_failure(&mut plan, "A").unwrap(), 3);
        let task = plan.task("A").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.blockers.contains(&"max retries exceeded".to_string()));
        assert!(next_task(&plan).is_none());
    }

    #[test]
    fn test_enforce_retry_cap_sweeps_over_cap_tasks() {
        let mut plan = plan_with(&[("A", 1, &[]), ("B", 2, &[])]);
        plan.task_mut("A").unwrap().retry_count = 3;

        let blocked = enforce_retry_cap(&mut plan).unwrap();
        assert_eq!(blocked, vec!["A".to_string()]);
        assert_eq!(plan.task("A").unwrap().status, TaskStatus::Blocked);
        assert_eq!(next_task(&plan).unwrap().id, "B");
    }

    #[test]
    fn test_recover_at_session_start() {
        let mut plan = plan_with(&[("A", 1, &[]), ("B", 2, &[])]);
        plan.mark_task_in_progress("A").unwrap();

        let reset = recover_at_session_start(&mut plan).unwrap();
        assert_eq!(reset, 1);
        assert_eq!(plan.task("A").unwrap().status, TaskStatus::Pending);
    }
}
