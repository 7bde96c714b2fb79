//! The supervisory iteration loop.
//!
//! One iteration: pre-iteration context build, executor call, post-
//! iteration accounting, recovery/halt decision, optional hand-off. The
//! loop is strictly sequential; exactly one executor call and one tool
//! call are in flight at any time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounting::{round_half_even, Accountant};
use crate::config::{MemoryLimits, RalphConfig};
use crate::error::Result;
use crate::events::{EventEnvelope, EventSink, NullSink, RunEvent};
use crate::executor::{
    cancel_pair, Executor, IterationRequest, IterationResult, ToolInvocation, ToolRouter,
};
use crate::memory::MemoryManager;
use crate::model::{
    ImplementationPlan, Injection, MemoryUpdateMode, Phase, RalphState, SessionArchive,
};
use crate::phase::{self, PromptContext};
use crate::safety::{self, Decision};
use crate::scheduler;
use crate::store::Store;
use crate::tools::{ToolCall, ToolDispatcher, ToolOutcome, TOOL_PREFIX};

mod recovery;

pub use recovery::{determine_recovery_action, RecoveryAction};

/// Terminal status of a loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    Paused,
    Halted,
    Failed,
}

/// Summary of a `run` invocation.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub status: LoopStatus,
    pub iterations_completed: u64,
    pub tasks_completed: u32,
    pub total_cost_usd: f64,
    pub total_tokens_used: u64,
    pub final_phase: Phase,
    pub halt_reason: Option<String>,
    pub error: Option<String>,
    pub session_count: u32,
}

/// Options for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Override for `config.max_iterations`.
    pub max_iterations: Option<u32>,
    /// Stop (successfully) once the current phase completes.
    pub single_phase: bool,
    /// Install a SIGINT handler that trips the cancellation token.
    pub handle_signals: bool,
}

/// Gates every tool invocation through the safety validator, then routes
/// orchestrator-owned tools to the dispatcher. Non-orchestrator tools are
/// executed by the transport itself; an `Allow` outcome tells it to
/// proceed.
pub struct GatedRouter {
    dispatcher: ToolDispatcher,
    current_phase: Phase,
    config: RalphConfig,
    phase_tools: Vec<String>,
    observed: std::sync::Mutex<(u64, f64)>,
}

impl GatedRouter {
    pub fn new(store: Store, config: RalphConfig, current_phase: Phase) -> Self {
        let phase_tools = phase::allowed_tools(&config, current_phase);
        Self {
            dispatcher: ToolDispatcher::new(store),
            current_phase,
            config,
            phase_tools,
            observed: std::sync::Mutex::new((0, 0.0)),
        }
    }

    /// Token/cost metadata accumulated by the post-call hook across this
    /// iteration's tool results.
    pub fn observed_usage(&self) -> (u64, f64) {
        *self.observed.lock().unwrap()
    }

    fn record_usage(&self, outcome: &ToolOutcome) {
        if let Some(data) = &outcome.data {
            if let Some((tokens, cost)) = safety::usage_from_result(data) {
                let mut observed = self.observed.lock().unwrap();
                observed.0 += tokens;
                observed.1 += cost;
            }
        }
    }
}

#[async_trait]
impl ToolRouter for GatedRouter {
    async fn route(&self, invocation: ToolInvocation) -> ToolOutcome {
        let decision = safety::validate_tool_use(
            &invocation.name,
            &invocation.input,
            self.current_phase,
            &self.config.safety,
            &self.phase_tools,
        );

        match decision {
            Decision::Deny { reason, suggestion } => {
                debug!(tool = %invocation.name, reason = %reason, "Tool call denied");
                ToolOutcome::denied(reason, suggestion)
            }
            Decision::Allow => {
                if invocation.name.starts_with(TOOL_PREFIX) {
                    match ToolCall::parse(&invocation.name, &invocation.input) {
                        Ok(call) => {
                            let outcome = self.dispatcher.dispatch(call).await;
                            self.record_usage(&outcome);
                            outcome
                        }
                        Err(e) => ToolOutcome::failure("invalid tool call", e.to_string()),
                    }
                } else {
                    ToolOutcome::ok("allowed", None)
                }
            }
        }
    }
}

/// The supervisory loop. Owns the store, the memory manager, and the
/// executor port; drives iterations until completion or a halt.
pub struct LoopRunner {
    store: Store,
    config: RalphConfig,
    accountant: Accountant,
    memory: MemoryManager,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
}

impl LoopRunner {
    pub fn new(store: Store, config: RalphConfig, executor: Arc<dyn Executor>) -> Self {
        let memory = MemoryManager::new(
            &store.paths().ralph_dir,
            MemoryLimits::from(&config.context),
        );
        let accountant = Accountant::new(Default::default(), config.cost_limits.clone());
        Self {
            store,
            config,
            accountant,
            memory,
            executor,
            sink: Arc::new(NullSink),
        }
    }

    /// Attach an observer for loop lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn emit(&self, event: RunEvent) {
        self.sink.emit(&EventEnvelope::new(event));
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Drive the loop. Returns when the work completes, the operator
    /// pauses, the circuit breaker halts, or the iteration cap is hit.
    pub async fn run(&self, options: RunOptions) -> Result<LoopResult> {
        let _lock = self.store.acquire_lock().await?;

        let max_iterations =
            options.max_iterations.unwrap_or(self.config.max_iterations) as u64;
        let mut iterations_completed: u64 = 0;
        let mut tasks_completed: u32 = 0;
        let mut session_count: u32 = 1;
        let mut last_iteration_cost: f64 = 0.0;

        loop {
            let mut state = self.store.load_state().await?;
            let mut plan = self.store.load_plan().await?;

            if state.paused {
                info!("Loop paused by operator");
                return Ok(self.result(LoopStatus::Paused, &state, iterations_completed, tasks_completed, session_count, None, None));
            }

            let (halt, reason) = state.should_halt();
            if halt {
                warn!(reason = ?reason, "Circuit breaker halt");
                self.emit(RunEvent::Halted {
                    reason: reason.clone().unwrap_or_default(),
                });
                return Ok(self.result(LoopStatus::Halted, &state, iterations_completed, tasks_completed, session_count, reason, None));
            }

            if iterations_completed >= max_iterations {
                self.emit(RunEvent::Halted {
                    reason: format!("max_iterations:{}", max_iterations),
                });
                return Ok(self.result(
                    LoopStatus::Halted,
                    &state,
                    iterations_completed,
                    tasks_completed,
                    session_count,
                    Some(format!("max_iterations:{}", max_iterations)),
                    None,
                ));
            }

            // Session bootstrap: fresh id plus stale-task recovery.
            if state.session_id.is_none() {
                self.start_session(&mut state, &mut plan).await?;
            } else if state.session_iteration_count == 0 {
                let reset = scheduler::recover_at_session_start(&mut plan)?;
                if reset > 0 {
                    info!(reset, "Reset stale in-progress tasks");
                    self.store.save_plan(&plan).await?;
                }
            }

            // Budget gate: a value at or past a limit denies this iteration.
            if let Err(budget_err) = self.accountant.check_budgets(
                last_iteration_cost,
                state.session_cost_usd,
                state.total_cost_usd,
            ) {
                warn!(error = %budget_err, "Budget exceeded");
                state.circuit_breaker.record_failure(budget_err.to_string());
                self.store.save_state(&state).await?;
                continue;
            }

            let outcome = self
                .run_one_iteration(&mut state, &mut plan, &options, &mut last_iteration_cost)
                .await?;
            iterations_completed += 1;
            if outcome.task_completed {
                tasks_completed += 1;
            }

            match outcome.next {
                NextAction::Continue => {}
                NextAction::Handoff(reason) => {
                    self.execute_handoff(&reason).await?;
                    session_count += 1;
                    last_iteration_cost = 0.0;
                }
                NextAction::PhaseTransition(next_phase) => {
                    let transitioned = self.transition_phase(next_phase).await?;
                    if transitioned && options.single_phase {
                        let state = self.store.load_state().await?;
                        return Ok(self.result(LoopStatus::Completed, &state, iterations_completed, tasks_completed, session_count, None, None));
                    }
                }
                NextAction::Stop(status, halt_reason, error) => {
                    let state = self.store.load_state().await?;
                    return Ok(self.result(status, &state, iterations_completed, tasks_completed, session_count, halt_reason, error));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        status: LoopStatus,
        state: &RalphState,
        iterations_completed: u64,
        tasks_completed: u32,
        session_count: u32,
        halt_reason: Option<String>,
        error: Option<String>,
    ) -> LoopResult {
        LoopResult {
            status,
            iterations_completed,
            tasks_completed,
            total_cost_usd: state.total_cost_usd,
            total_tokens_used: state.total_tokens_used,
            final_phase: state.current_phase,
            halt_reason,
            error,
            session_count,
        }
    }

    async fn run_one_iteration(
        &self,
        state: &mut RalphState,
        plan: &mut ImplementationPlan,
        options: &RunOptions,
        last_iteration_cost: &mut f64,
    ) -> Result<IterationOutcome> {
        // Pre-iteration: retry sweep, context assembly.
        let blocked = scheduler::enforce_retry_cap(plan)?;
        if !blocked.is_empty() {
            self.store.save_plan(plan).await?;
        }

        let current_task = scheduler::next_task(plan).cloned();
        let injections = self.store.load_injections().await?;
        let active_memory = self.memory.build_active_memory(state, plan).await;

        state.start_iteration();
        self.store.save_state(state).await?;

        let current_phase = state.current_phase;
        let model = phase::model_for_phase(&self.config, current_phase).to_string();
        let iteration = state.iteration_count;
        let complete_before = plan.complete_count();
        let tasks_before = plan.tasks.len();
        let signals_before = state.completion_signals.len();

        info!(
            iteration,
            phase = %current_phase,
            task = current_task.as_ref().map(|t| t.id.as_str()).unwrap_or("-"),
            "Starting iteration"
        );
        self.emit(RunEvent::IterationStarted {
            iteration,
            phase: current_phase,
            task_id: current_task.as_ref().map(|t| t.id.clone()),
        });

        let result = self
            .invoke_executor(
                state,
                &current_task,
                &injections,
                &active_memory,
                &model,
                options.handle_signals,
            )
            .await;

        // Injections live for exactly one iteration.
        if !injections.is_empty() {
            self.store.clear_injections().await?;
        }

        // Tool calls mutated the on-disk snapshot; ours is stale.
        *state = self.store.load_state().await?;
        *plan = self.store.load_plan().await?;

        let cancelled = result
            .error
            .as_deref()
            .map(|e| e == "cancelled")
            .unwrap_or(false);
        let task_completed = result.task_completed || plan.complete_count() > complete_before;
        let progress_made = result.success
            && (task_completed
                || plan.tasks.len() > tasks_before
                || state.completion_signals.len() > signals_before);

        let tokens_used = result.tokens_used();
        let mut cost = result.cost_usd;
        if cost == 0.0 && tokens_used > 0 {
            cost = self
                .accountant
                .cost_for(result.input_tokens, result.output_tokens, &model);
        }
        cost = round_half_even(cost, 4);
        *last_iteration_cost = cost;

        state.end_iteration(cost, tokens_used);

        let mut forced_handoff: Option<String> = None;
        if result.success {
            state
                .circuit_breaker
                .record_success(u32::from(task_completed), progress_made);
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown_error".to_string());
            state.circuit_breaker.record_failure(error.as_str());

            if let Some(task) = &current_task {
                scheduler::record_task_failure(plan, &task.id)?;
            }

            let action =
                determine_recovery_action(state, plan, &error, self.config.safety.max_retries);
            info!(action = %action, error = %error, "Iteration failed");
            match action {
                RecoveryAction::Retry => {}
                RecoveryAction::SkipTask => {
                    if let Some(task) = &current_task {
                        // record_task_failure may already have blocked it
                        if plan.task(&task.id).map(|t| t.status) == Some(crate::model::TaskStatus::Pending) {
                            plan.mark_task_blocked(&task.id, &error)?;
                        }
                    }
                }
                RecoveryAction::Handoff => {
                    forced_handoff = Some("recovery_handoff".to_string());
                }
                RecoveryAction::ManualIntervention => {
                    state.paused = true;
                }
            }
        }

        // Flush a queued update-memory payload.
        if let Some(update) = state.pending_memory_update.take() {
            self.memory
                .apply_memory_update(&update.content, update.mode == MemoryUpdateMode::Append)
                .await?;
        }

        self.memory
            .capture_iteration(
                state,
                plan,
                progress_made,
                tokens_used,
                cost,
                result.error.as_deref(),
            )
            .await?;

        self.store.save_plan(plan).await?;
        self.store.save_state(state).await?;

        debug!(
            iteration,
            cost_usd = cost,
            tokens = tokens_used,
            task_completed,
            "Iteration recorded"
        );
        self.emit(RunEvent::IterationFinished {
            iteration,
            phase: current_phase,
            success: result.success,
            task_completed,
            cost_usd: cost,
            tokens_used,
        });

        // Decide what happens next.
        let (halt, reason) = state.should_halt();
        let next = if cancelled {
            NextAction::Stop(
                LoopStatus::Halted,
                Some("cancelled".to_string()),
                Some("cancelled".to_string()),
            )
        } else if halt {
            NextAction::Stop(LoopStatus::Halted, reason, result.error.clone())
        } else if state.paused {
            NextAction::Stop(LoopStatus::Paused, None, result.error.clone())
        } else if let Some(reason) = forced_handoff {
            NextAction::Handoff(reason)
        } else if state.needs_handoff() || result.needs_handoff {
            NextAction::Handoff("context_budget".to_string())
        } else if let Some(next_phase) = phase::completion_ready(state, plan) {
            NextAction::PhaseTransition(next_phase)
        } else if state.current_phase == Phase::Validation
            && state.is_phase_complete(Phase::Validation)
        {
            NextAction::Stop(LoopStatus::Completed, None, None)
        } else {
            NextAction::Continue
        };

        Ok(IterationOutcome {
            task_completed,
            next,
        })
    }

    async fn invoke_executor(
        &self,
        state: &RalphState,
        current_task: &Option<crate::model::Task>,
        injections: &[Injection],
        active_memory: &str,
        model: &str,
        handle_signals: bool,
    ) -> IterationResult {
        let current_phase = state.current_phase;
        let ctx = PromptContext {
            config: &self.config,
            phase: current_phase,
            iteration: state.iteration_count,
            task: current_task.as_ref(),
            active_memory,
            injections,
            remaining_tokens: state.context_budget.available_tokens(),
            usage_percentage: state.context_budget.usage_percentage(),
        };

        let router = GatedRouter::new(self.store.clone(), self.config.clone(), current_phase);
        let (cancel_handle, cancel_token) = cancel_pair();

        let request = IterationRequest {
            system_prompt: phase::build_system_prompt(&ctx),
            user_prompt: phase::build_user_prompt(&ctx),
            allowed_tools: phase::allowed_tools(&self.config, current_phase),
            max_turns: phase::max_turns(&self.config, current_phase),
            model: model.to_string(),
            timeout: Duration::from_secs(self.config.build.command_timeout_secs),
            cancel: cancel_token,
            router: &router,
        };

        let exec_fut = self.executor.run_iteration(request);

        let result = if handle_signals {
            tokio::pin!(exec_fut);
            tokio::select! {
                res = &mut exec_fut => res,
                _ = tokio::signal::ctrl_c() => {
                    warn!("SIGINT received, cancelling iteration");
                    cancel_handle.cancel();
                    exec_fut.await
                }
            }
        } else {
            exec_fut.await
        };

        let mut result = match result {
            Ok(result) => result,
            Err(e) => IterationResult {
                success: false,
                error: Some(e.to_string()),
                ..IterationResult::default()
            },
        };

        // Post-call hook fallback: a transport that reports no usage of
        // its own still gets tool-result metadata accounted for.
        let (observed_tokens, observed_cost) = router.observed_usage();
        if result.tokens_used() == 0 && observed_tokens > 0 {
            result.input_tokens = observed_tokens;
        }
        if result.cost_usd == 0.0 && observed_cost > 0.0 {
            result.cost_usd = observed_cost;
        }
        result
    }

    async fn start_session(
        &self,
        state: &mut RalphState,
        plan: &mut ImplementationPlan,
    ) -> Result<()> {
        let session_id = new_session_id(state.iteration_count);
        info!(session_id = %session_id, "Starting session");

        state.start_new_session(&session_id);
        state.context_budget.total_capacity = self.config.context.total_capacity;
        state.context_budget.safety_margin = self.config.context.safety_margin;
        state.circuit_breaker.max_consecutive_failures = self.config.circuit_breaker_failures;
        state.circuit_breaker.max_stagnation_iterations = self.config.circuit_breaker_stagnation;
        state.circuit_breaker.max_cost_usd = self.config.max_cost_usd;

        let reset = scheduler::recover_at_session_start(plan)?;
        if reset > 0 {
            info!(reset, "Reset stale in-progress tasks");
            self.store.save_plan(plan).await?;
        }
        self.store.save_state(state).await?;
        Ok(())
    }

    /// Session hand-off: capture memory, archive the session, rotate, clear
    /// injections, and open a fresh session with a new id.
    pub async fn execute_handoff(&self, reason: &str) -> Result<String> {
        self.execute_handoff_with_summary(reason, None).await
    }

    pub async fn execute_handoff_with_summary(
        &self,
        reason: &str,
        summary: Option<&str>,
    ) -> Result<String> {
        let mut state = self.store.load_state().await?;
        let plan = self.store.load_plan().await?;

        self.emit(RunEvent::HandoffStarted {
            session_id: state.session_id.clone().unwrap_or_default(),
            reason: reason.to_string(),
        });

        self.memory
            .capture_session_handoff(&state, &plan, reason)
            .await?;
        self.memory.write_memory_file(&state, &plan, summary).await?;
        let (rotated, deleted) = self.memory.rotate().await?;
        if rotated > 0 || deleted > 0 {
            debug!(rotated, deleted, "Memory rotation");
        }

        self.store
            .append_session_archive(&SessionArchive {
                session_id: state
                    .session_id
                    .clone()
                    .unwrap_or_else(|| format!("session-{}", state.iteration_count)),
                iteration: state.iteration_count,
                started_at: state.started_at,
                ended_at: Utc::now(),
                tokens_used: state.session_tokens_used,
                cost_usd: round_half_even(state.session_cost_usd, 4),
                tasks_completed: state.tasks_completed_this_session,
                phase: state.current_phase,
                handoff_reason: reason.to_string(),
            })
            .await?;

        self.store.clear_injections().await?;

        let next_id = new_session_id(state.iteration_count);
        state.circuit_breaker.resume();
        state.start_new_session(&next_id);
        self.store.save_state(&state).await?;

        info!(session_id = %next_id, reason = %reason, "Hand-off complete");
        self.emit(RunEvent::HandoffFinished {
            next_session_id: next_id.clone(),
        });
        Ok(next_id)
    }

    /// Perform a legal phase transition, capturing phase memory first.
    async fn transition_phase(&self, next_phase: Phase) -> Result<bool> {
        let mut state = self.store.load_state().await?;
        let plan = self.store.load_plan().await?;
        let completed_phase = state.current_phase;

        phase::check_transition(completed_phase, next_phase, &plan, false)?;

        let summary = state
            .completion_signals
            .get(completed_phase.as_str())
            .map(|s| s.summary.clone())
            .unwrap_or_else(|| format!("{} phase complete", completed_phase));
        let artifacts = state
            .completion_signals
            .get(completed_phase.as_str())
            .map(|s| s.artifacts.clone())
            .unwrap_or_default();

        self.memory
            .capture_phase_transition(&state, completed_phase, artifacts, summary)
            .await?;

        state.clear_phase_completion(completed_phase);
        state.advance_phase(next_phase);
        self.store.save_state(&state).await?;

        info!(from = %completed_phase, to = %next_phase, "Phase transition");
        self.emit(RunEvent::PhaseChanged {
            from: completed_phase,
            to: next_phase,
        });
        Ok(true)
    }
}

fn new_session_id(iteration: u64) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("s-{}-{}", iteration + 1, suffix)
}

struct IterationOutcome {
    task_completed: bool,
    next: NextAction,
}

enum NextAction {
    Continue,
    Handoff(String),
    PhaseTransition(Phase),
    Stop(LoopStatus, Option<String>, Option<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique_and_opaque() {
        let a = new_session_id(0);
        let b = new_session_id(0);
        assert_ne!(a, b);
        assert!(a.starts_with("s-1-"));
    }
}
