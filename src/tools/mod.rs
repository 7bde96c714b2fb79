//! Orchestrator-owned tool surface.
//!
//! The only way the executor changes persistent state. Each tool is a
//! tagged variant carrying its validated payload; the dispatcher loads
//! the latest snapshot, applies a pure transition, persists atomically,
//! and returns a structured outcome. Violations come back as tool
//! failures, never orchestrator crashes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{RalphError, Result};
use crate::model::{MemoryUpdate, MemoryUpdateMode, Phase, SessionNoteKind, Task};
use crate::scheduler;
use crate::store::Store;

/// Tool name prefix marking orchestrator-owned tools; these bypass the
/// phase allowlist.
pub const TOOL_PREFIX: &str = "ralph_";

/// Structured result returned to the executor for every tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub content: String,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            content: content.into(),
            data,
            error: None,
        }
    }

    pub fn failure(content: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// Safety denial: a normal tool failure from the executor's point of
    /// view, carrying the validator's reason.
    pub fn denied(reason: impl Into<String>, suggestion: Option<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            content: format!("denied: {}", reason),
            data: suggestion.map(|s| json!({ "suggestion": s })),
            error: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TaskIdPayload {
    task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkCompletePayload {
    task_id: String,
    #[serde(default)]
    verification_notes: Option<String>,
    #[serde(default)]
    tokens_used: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkBlockedPayload {
    task_id: String,
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AppendLearningPayload {
    text: String,
    #[serde(default = "default_category")]
    category: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct AddTaskPayload {
    id: String,
    description: String,
    priority: i64,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    verification_criteria: Vec<String>,
    #[serde(default)]
    estimated_tokens: Option<u64>,
    #[serde(default)]
    spec_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SignalPhasePayload {
    phase: String,
    summary: String,
    #[serde(default)]
    artifacts: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateMemoryPayload {
    content: String,
    #[serde(default = "default_memory_mode")]
    mode: String,
}

fn default_memory_mode() -> String {
    "append".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct SessionNotePayload {
    kind: SessionNoteKind,
    content: String,
}

/// One mutator per variant; the dispatcher matches on the tag.
#[derive(Debug, Clone)]
pub enum ToolCall {
    GetNextTask,
    MarkTaskComplete {
        task_id: String,
        notes: Option<String>,
        tokens_used: Option<u64>,
    },
    MarkTaskBlocked {
        task_id: String,
        reason: String,
    },
    MarkTaskInProgress {
        task_id: String,
    },
    IncrementRetry {
        task_id: String,
    },
    AppendLearning {
        text: String,
        category: String,
    },
    AddTask {
        task: Task,
    },
    GetPlanSummary,
    GetStateSummary,
    SignalPhaseComplete {
        phase: Phase,
        summary: String,
        artifacts: BTreeMap<String, Value>,
    },
    UpdateMemory {
        content: String,
        mode: MemoryUpdateMode,
    },
    RecordSessionNote {
        kind: SessionNoteKind,
        content: String,
    },
}

impl ToolCall {
    /// Parse a named invocation with a free-form JSON payload into a
    /// typed call. Unknown names and malformed payloads are
    /// `InvalidToolCall` errors.
    pub fn parse(name: &str, input: &Value) -> Result<Self> {
        let bad = |message: String| RalphError::InvalidToolCall {
            tool: name.to_string(),
            message,
        };

        match name {
            "ralph_get_next_task" => Ok(Self::GetNextTask),
            "ralph_mark_task_complete" => {
                let payload: MarkCompletePayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::MarkTaskComplete {
                    task_id: payload.task_id,
                    notes: payload.verification_notes,
                    tokens_used: payload.tokens_used,
                })
            }
            "ralph_mark_task_blocked" => {
                let payload: MarkBlockedPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::MarkTaskBlocked {
                    task_id: payload.task_id,
                    reason: payload.reason,
                })
            }
            "ralph_mark_task_in_progress" => {
                let payload: TaskIdPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::MarkTaskInProgress {
                    task_id: payload.task_id,
                })
            }
            "ralph_increment_retry" => {
                let payload: TaskIdPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::IncrementRetry {
                    task_id: payload.task_id,
                })
            }
            "ralph_append_learning" => {
                let payload: AppendLearningPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::AppendLearning {
                    text: payload.text,
                    category: payload.category,
                })
            }
            "ralph_add_task" => {
                let payload: AddTaskPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                let mut task = Task::new(payload.id, payload.description, payload.priority)
                    .with_dependencies(payload.dependencies)
                    .with_verification_criteria(payload.verification_criteria)
                    .with_spec_files(payload.spec_files);
                if let Some(tokens) = payload.estimated_tokens {
                    task = task.with_estimated_tokens(tokens);
                }
                Ok(Self::AddTask { task })
            }
            "ralph_get_plan_summary" => Ok(Self::GetPlanSummary),
            "ralph_get_state_summary" => Ok(Self::GetStateSummary),
            "ralph_signal_phase_complete" => {
                let payload: SignalPhasePayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                let phase = Phase::parse(&payload.phase)
                    .ok_or_else(|| bad(format!("invalid phase: {}", payload.phase)))?;
                Ok(Self::SignalPhaseComplete {
                    phase,
                    summary: payload.summary,
                    artifacts: payload.artifacts,
                })
            }
            "ralph_update_memory" => {
                let payload: UpdateMemoryPayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                let mode = match payload.mode.as_str() {
                    "append" => MemoryUpdateMode::Append,
                    "replace" => MemoryUpdateMode::Replace,
                    other => return Err(bad(format!("invalid mode: {}", other))),
                };
                Ok(Self::UpdateMemory {
                    content: payload.content,
                    mode,
                })
            }
            "ralph_record_session_note" => {
                let payload: SessionNotePayload =
                    serde_json::from_value(input.clone()).map_err(|e| bad(e.to_string()))?;
                Ok(Self::RecordSessionNote {
                    kind: payload.kind,
                    content: payload.content,
                })
            }
            _ => Err(bad("unknown tool".to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetNextTask => "ralph_get_next_task",
            Self::MarkTaskComplete { .. } => "ralph_mark_task_complete",
            Self::MarkTaskBlocked { .. } => "ralph_mark_task_blocked",
            Self::MarkTaskInProgress { .. } => "ralph_mark_task_in_progress",
            Self::IncrementRetry { .. } => "ralph_increment_retry",
            Self::AppendLearning { .. } => "ralph_append_learning",
            Self::AddTask { .. } => "ralph_add_task",
            Self::GetPlanSummary => "ralph_get_plan_summary",
            Self::GetStateSummary => "ralph_get_state_summary",
            Self::SignalPhaseComplete { .. } => "ralph_signal_phase_complete",
            Self::UpdateMemory { .. } => "ralph_update_memory",
            Self::RecordSessionNote { .. } => "ralph_record_session_note",
        }
    }
}

/// Applies tool calls against the store: read latest snapshot, pure
/// transition, atomic save. One call at a time; each call's effect is
/// persisted before the next is accepted.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    store: Store,
}

impl ToolDispatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn dispatch(&self, call: ToolCall) -> ToolOutcome {
        debug!(tool = call.name(), "Dispatching tool call");
        match self.apply(call).await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::failure("tool call failed", e.to_string()),
        }
    }

    async fn apply(&self, call: ToolCall) -> Result<ToolOutcome> {
        match call {
            ToolCall::GetNextTask => self.get_next_task().await,
            ToolCall::MarkTaskComplete {
                task_id,
                notes,
                tokens_used,
            } => self.mark_task_complete(&task_id, notes, tokens_used).await,
            ToolCall::MarkTaskBlocked { task_id, reason } => {
                self.mark_task_blocked(&task_id, &reason).await
            }
            ToolCall::MarkTaskInProgress { task_id } => {
                self.mark_task_in_progress(&task_id).await
            }
            ToolCall::IncrementRetry { task_id } => self.increment_retry(&task_id).await,
            ToolCall::AppendLearning { text, category } => {
                self.append_learning(&text, &category).await
            }
            ToolCall::AddTask { task } => self.add_task(task).await,
            ToolCall::GetPlanSummary => self.plan_summary().await,
            ToolCall::GetStateSummary => self.state_summary().await,
            ToolCall::SignalPhaseComplete {
                phase,
                summary,
                artifacts,
            } => self.signal_phase_complete(phase, summary, artifacts).await,
            ToolCall::UpdateMemory { content, mode } => {
                self.update_memory(content, mode).await
            }
            ToolCall::RecordSessionNote { kind, content } => {
                self.record_session_note(kind, content).await
            }
        }
    }

    async fn get_next_task(&self) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;
        let blocked = scheduler::enforce_retry_cap(&mut plan)?;
        if !blocked.is_empty() {
            self.store.save_plan(&plan).await?;
        }

        match scheduler::next_task(&plan) {
            Some(task) => {
                let data = json!({
                    "task": {
                        "id": task.id,
                        "description": task.description,
                        "priority": task.priority,
                        "status": task.status.to_string(),
                        "dependencies": task.dependencies,
                        "verification_criteria": task.verification_criteria,
                        "estimated_tokens": task.estimated_tokens,
                        "retry_count": task.retry_count,
                    },
                    "remaining_count": plan.pending_count(),
                });
                Ok(ToolOutcome::ok(
                    format!("Next task: {}", task.description),
                    Some(data),
                ))
            }
            None => Ok(ToolOutcome::ok(
                "No runnable task. All tasks may be complete or blocked.",
                Some(json!({ "task": null, "remaining_count": plan.pending_count() })),
            )),
        }
    }

    async fn mark_task_complete(
        &self,
        task_id: &str,
        notes: Option<String>,
        tokens_used: Option<u64>,
    ) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;
        let mut state = self.store.load_state().await?;

        match plan.mark_task_complete(task_id, notes, tokens_used) {
            Ok(()) => {}
            Err(e @ RalphError::UnknownTask(_)) | Err(e @ RalphError::InvalidTransition { .. }) => {
                return Ok(ToolOutcome::failure(
                    format!("Cannot complete task: {}", task_id),
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        state.tasks_completed_this_session += 1;
        self.store.save_plan(&plan).await?;
        self.store.save_state(&state).await?;

        Ok(ToolOutcome::ok(
            format!("Task completed: {}", task_id),
            Some(json!({
                "task_id": task_id,
                "completion_percentage": plan.completion_percentage(),
                "remaining_tasks": plan.pending_count(),
            })),
        ))
    }

    async fn mark_task_blocked(&self, task_id: &str, reason: &str) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;

        match plan.mark_task_blocked(task_id, reason) {
            Ok(()) => {}
            Err(e @ RalphError::UnknownTask(_)) | Err(e @ RalphError::InvalidTransition { .. }) => {
                return Ok(ToolOutcome::failure(
                    format!("Cannot block task: {}", task_id),
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        self.store.save_plan(&plan).await?;
        Ok(ToolOutcome::ok(
            format!("Task blocked: {} - {}", task_id, reason),
            Some(json!({
                "task_id": task_id,
                "reason": reason,
                "remaining_tasks": plan.pending_count(),
            })),
        ))
    }

    async fn mark_task_in_progress(&self, task_id: &str) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;

        match plan.mark_task_in_progress(task_id) {
            Ok(()) => {}
            Err(e @ RalphError::UnknownTask(_)) | Err(e @ RalphError::InvalidTransition { .. }) => {
                return Ok(ToolOutcome::failure(
                    format!("Cannot start task: {}", task_id),
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        self.store.save_plan(&plan).await?;
        Ok(ToolOutcome::ok(
            format!("Task started: {}", task_id),
            Some(json!({ "task_id": task_id, "status": "in_progress" })),
        ))
    }

    async fn increment_retry(&self, task_id: &str) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;

        let count = match scheduler::record_task_failure(&mut plan, task_id) {
            Ok(count) => count,
            Err(e @ RalphError::UnknownTask(_)) => {
                return Ok(ToolOutcome::failure(
                    format!("Cannot increment retry: {}", task_id),
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        self.store.save_plan(&plan).await?;
        Ok(ToolOutcome::ok(
            format!("Retry count incremented for: {}", task_id),
            Some(json!({ "task_id": task_id, "retry_count": count })),
        ))
    }

    async fn append_learning(&self, text: &str, category: &str) -> Result<ToolOutcome> {
        self.store.append_progress(category, text).await?;
        Ok(ToolOutcome::ok(
            "Learning recorded",
            Some(json!({ "category": category })),
        ))
    }

    async fn add_task(&self, task: Task) -> Result<ToolOutcome> {
        let mut plan = self.store.load_plan().await?;
        let task_id = task.id.clone();
        let priority = task.priority;

        match plan.add_task(task) {
            Ok(()) => {}
            Err(
                e @ (RalphError::DuplicateId(_)
                | RalphError::UnknownDependency { .. }
                | RalphError::CycleIntroduced(_)),
            ) => {
                return Ok(ToolOutcome::failure(
                    format!("Cannot add task: {}", task_id),
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        self.store.save_plan(&plan).await?;
        Ok(ToolOutcome::ok(
            format!("Task added: {}", task_id),
            Some(json!({
                "task_id": task_id,
                "priority": priority,
                "total_tasks": plan.tasks.len(),
            })),
        ))
    }

    async fn plan_summary(&self) -> Result<ToolOutcome> {
        let plan = self.store.load_plan().await?;

        let mut data = json!({
            "total_tasks": plan.tasks.len(),
            "complete": plan.complete_count(),
            "pending": plan.pending_count(),
            "blocked": plan.blocked_count(),
            "in_progress": plan.in_progress_count(),
            "completion_percentage": plan.completion_percentage(),
        });

        let mut content = vec![format!(
            "Tasks: {}/{} complete ({:.0}%)",
            plan.complete_count(),
            plan.tasks.len(),
            plan.completion_percentage() * 100.0
        )];

        if let Some(next) = scheduler::next_task(&plan) {
            data["next_task"] = json!({
                "id": next.id,
                "description": next.description,
                "priority": next.priority,
            });
            content.push(format!("Next: {}", next.description));
        }

        Ok(ToolOutcome::ok(content.join("\n"), Some(data)))
    }

    async fn state_summary(&self) -> Result<ToolOutcome> {
        let state = self.store.load_state().await?;
        let (should_halt, halt_reason) = state.should_halt();

        let data = json!({
            "phase": state.current_phase.to_string(),
            "iteration": state.iteration_count,
            "session_id": state.session_id,
            "total_cost_usd": state.total_cost_usd,
            "session_cost_usd": state.session_cost_usd,
            "total_tokens": state.total_tokens_used,
            "session_tokens": state.session_tokens_used,
            "tasks_completed_this_session": state.tasks_completed_this_session,
            "circuit_breaker": {
                "state": state.circuit_breaker.state.to_string(),
                "failure_count": state.circuit_breaker.failure_count,
                "stagnation_count": state.circuit_breaker.stagnation_count,
            },
            "should_halt": should_halt,
            "halt_reason": halt_reason,
        });

        let content = format!(
            "Phase: {}, Iteration: {}\nSession tasks: {}, Cost: ${:.4}\nCircuit breaker: {}",
            state.current_phase,
            state.iteration_count,
            state.tasks_completed_this_session,
            state.session_cost_usd,
            state.circuit_breaker.state,
        );

        Ok(ToolOutcome::ok(content, Some(data)))
    }

    async fn signal_phase_complete(
        &self,
        phase: Phase,
        summary: String,
        artifacts: BTreeMap<String, Value>,
    ) -> Result<ToolOutcome> {
        let mut state = self.store.load_state().await?;
        state.signal_phase_complete(phase, summary.clone(), artifacts);
        self.store.save_state(&state).await?;

        Ok(ToolOutcome::ok(
            format!("Phase '{}' marked complete: {}", phase, summary),
            Some(json!({ "phase": phase.to_string(), "summary": summary })),
        ))
    }

    async fn update_memory(
        &self,
        content: String,
        mode: MemoryUpdateMode,
    ) -> Result<ToolOutcome> {
        let mut state = self.store.load_state().await?;
        let length = content.len();
        state.pending_memory_update = Some(MemoryUpdate {
            content,
            mode,
            timestamp: chrono::Utc::now(),
        });
        self.store.save_state(&state).await?;

        Ok(ToolOutcome::ok(
            format!("Memory update queued ({} chars)", length),
            Some(json!({ "length": length, "queued": true })),
        ))
    }

    async fn record_session_note(
        &self,
        kind: SessionNoteKind,
        content: String,
    ) -> Result<ToolOutcome> {
        let mut state = self.store.load_state().await?;
        state.record_session_note(kind, content.clone());
        self.store.save_state(&state).await?;

        Ok(ToolOutcome::ok(
            format!("Session note recorded ({})", kind),
            Some(json!({ "kind": kind.to_string(), "content": content })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_tools() {
        let call = ToolCall::parse("ralph_get_next_task", &json!({})).unwrap();
        assert_eq!(call.name(), "ralph_get_next_task");

        let call = ToolCall::parse(
            "ralph_mark_task_complete",
            &json!({"task_id": "A", "verification_notes": "ok", "tokens_used": 100}),
        )
        .unwrap();
        match call {
            ToolCall::MarkTaskComplete {
                task_id,
                notes,
                tokens_used,
            } => {
                assert_eq!(task_id, "A");
                assert_eq!(notes.as_deref(), Some("ok"));
                assert_eq!(tokens_used, Some(100));
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_tool() {
        let err = ToolCall::parse("ralph_delete_everything", &json!({})).unwrap_err();
        assert!(matches!(err, RalphError::InvalidToolCall { .. }));
    }

    #[test]
    fn test_parse_missing_field() {
        let err = ToolCall::parse("ralph_mark_task_blocked", &json!({"task_id": "A"})).unwrap_err();
        assert!(matches!(err, RalphError::InvalidToolCall { .. }));
    }

    #[test]
    fn test_parse_add_task_defaults() {
        let call = ToolCall::parse(
            "ralph_add_task",
            &json!({"id": "T1", "description": "first", "priority": 1}),
        )
        .unwrap();
        match call {
            ToolCall::AddTask { task } => {
                assert_eq!(task.id, "T1");
                assert!(task.dependencies.is_empty());
                assert_eq!(task.estimated_tokens, 30_000);
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[test]
    fn test_parse_signal_rejects_bad_phase() {
        let err = ToolCall::parse(
            "ralph_signal_phase_complete",
            &json!({"phase": "deploy", "summary": "x"}),
        )
        .unwrap_err();
        assert!(matches!(err, RalphError::InvalidToolCall { .. }));
    }

    #[test]
    fn test_parse_record_session_note() {
        let call = ToolCall::parse(
            "ralph_record_session_note",
            &json!({"kind": "architectural_decision", "content": "event-sourced store"}),
        )
        .unwrap();
        assert!(matches!(
            call,
            ToolCall::RecordSessionNote {
                kind: SessionNoteKind::ArchitecturalDecision,
                ..
            }
        ));

        let err = ToolCall::parse(
            "ralph_record_session_note",
            &json!({"kind": "random_thought", "content": "x"}),
        )
        .unwrap_err();
        assert!(matches!(err, RalphError::InvalidToolCall { .. }));
    }

    #[test]
    fn test_parse_update_memory_modes() {
        let call = ToolCall::parse(
            "ralph_update_memory",
            &json!({"content": "notes", "mode": "replace"}),
        )
        .unwrap();
        assert!(matches!(
            call,
            ToolCall::UpdateMemory {
                mode: MemoryUpdateMode::Replace,
                ..
            }
        ));

        let err = ToolCall::parse(
            "ralph_update_memory",
            &json!({"content": "notes", "mode": "overwrite"}),
        )
        .unwrap_err();
        assert!(matches!(err, RalphError::InvalidToolCall { .. }));
    }
}
