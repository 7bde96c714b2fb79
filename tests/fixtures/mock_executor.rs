//! Scripted executor for driving the loop without an LLM.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use ralph::error::Result;
use ralph::executor::{Executor, IterationRequest, IterationResult, ToolInvocation};
use ralph::tools::ToolOutcome;

/// One scripted iteration of executor behavior.
#[derive(Debug, Clone)]
pub enum Step {
    /// Success without completing anything.
    Idle { input_tokens: u64, output_tokens: u64 },
    /// Fetch the next task via tools, mark it in progress, complete it.
    CompleteNext { input_tokens: u64, output_tokens: u64 },
    /// Route the given raw tool invocations, then return the result.
    Invoke {
        calls: Vec<(String, Value)>,
        result: IterationResult,
    },
    /// Transport-level failure.
    Fail { error: String },
}

/// Executor that replays a fixed script, recording every tool outcome it
/// observes for later assertions. When the script runs out it idles.
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    outcomes: Mutex<Vec<(String, ToolOutcome)>>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_outcomes(&self) -> Vec<(String, ToolOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        self.steps.lock().unwrap().pop_front().unwrap_or(Step::Idle {
            input_tokens: 100,
            output_tokens: 50,
        })
    }

    fn record(&self, name: &str, outcome: &ToolOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .push((name.to_string(), outcome.clone()));
    }

    async fn route(&self, request: &IterationRequest<'_>, name: &str, input: Value) -> ToolOutcome {
        let outcome = request
            .router
            .route(ToolInvocation {
                name: name.to_string(),
                input,
            })
            .await;
        self.record(name, &outcome);
        outcome
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run_iteration(&self, request: IterationRequest<'_>) -> Result<IterationResult> {
        if request.cancel.is_cancelled() {
            return Ok(IterationResult::cancelled());
        }

        match self.next_step() {
            Step::Idle {
                input_tokens,
                output_tokens,
            } => Ok(IterationResult {
                success: true,
                input_tokens,
                output_tokens,
                tool_calls: 0,
                duration_ms: 10,
                ..IterationResult::default()
            }),

            Step::CompleteNext {
                input_tokens,
                output_tokens,
            } => {
                let next = self
                    .route(&request, "ralph_get_next_task", json!({}))
                    .await;
                let task_id = next
                    .data
                    .as_ref()
                    .and_then(|d| d.get("task"))
                    .and_then(|t| t.get("id"))
                    .and_then(|id| id.as_str())
                    .map(|id| id.to_string());

                let Some(task_id) = task_id else {
                    return Ok(IterationResult {
                        success: true,
                        input_tokens,
                        output_tokens,
                        tool_calls: 1,
                        duration_ms: 10,
                        ..IterationResult::default()
                    });
                };

                self.route(
                    &request,
                    "ralph_mark_task_in_progress",
                    json!({ "task_id": task_id }),
                )
                .await;
                let completion = self
                    .route(
                        &request,
                        "ralph_mark_task_complete",
                        json!({
                            "task_id": task_id,
                            "verification_notes": "all checks pass",
                            "tokens_used": input_tokens + output_tokens,
                        }),
                    )
                    .await;

                Ok(IterationResult {
                    success: true,
                    task_completed: completion.success,
                    task_id: Some(task_id),
                    input_tokens,
                    output_tokens,
                    tool_calls: 3,
                    duration_ms: 25,
                    ..IterationResult::default()
                })
            }

            Step::Invoke { calls, result } => {
                for (name, input) in calls {
                    self.route(&request, &name, input).await;
                }
                Ok(result)
            }

            Step::Fail { error } => Ok(IterationResult {
                success: false,
                error: Some(error),
                duration_ms: 5,
                ..IterationResult::default()
            }),
        }
    }
}
