use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;

/// Circuit breaker nominal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Failure/stagnation detector. Cost is tracked on [`RalphState`] as the
/// single source of truth and passed into [`CircuitBreakerState::should_halt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub stagnation_count: u32,
    pub max_consecutive_failures: u32,
    pub max_stagnation_iterations: u32,
    pub max_cost_usd: f64,
    pub last_failure_reason: Option<String>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            stagnation_count: 0,
            max_consecutive_failures: 3,
            max_stagnation_iterations: 5,
            max_cost_usd: 100.0,
            last_failure_reason: None,
        }
    }
}

impl CircuitBreakerState {
    pub fn record_success(&mut self, tasks_completed: u32, progress_made: bool) {
        self.failure_count = 0;
        if tasks_completed > 0 || progress_made {
            self.stagnation_count = 0;
        } else {
            self.stagnation_count += 1;
        }
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
        }
        if self.stagnation_count >= self.max_stagnation_iterations {
            self.state = CircuitState::Open;
        }
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.failure_count += 1;
        self.stagnation_count += 1;
        self.last_failure_reason = Some(reason.into());
        if self.state == CircuitState::HalfOpen
            || self.failure_count >= self.max_consecutive_failures
        {
            self.state = CircuitState::Open;
        }
    }

    /// Halt predicate. Reasons are stable strings consumed by the recovery
    /// table and surfaced verbatim to the operator.
    pub fn should_halt(&self, current_cost_usd: f64) -> (bool, Option<String>) {
        if self.failure_count >= self.max_consecutive_failures {
            return (
                true,
                Some(format!("consecutive_failures:{}", self.failure_count)),
            );
        }
        if self.stagnation_count >= self.max_stagnation_iterations {
            return (true, Some(format!("stagnation:{}", self.stagnation_count)));
        }
        if current_cost_usd >= self.max_cost_usd {
            return (true, Some(format!("cost_limit:${:.2}", current_cost_usd)));
        }
        (false, None)
    }

    /// Operator resume or hand-off: one trial iteration is allowed.
    pub fn resume(&mut self) {
        if self.state == CircuitState::Open {
            self.state = CircuitState::HalfOpen;
            self.failure_count = 0;
            self.stagnation_count = 0;
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.stagnation_count = 0;
        self.last_failure_reason = None;
    }
}

/// Token budget for one context window. Targets the 40-60% "smart zone";
/// crossing 60% triggers a hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    pub total_capacity: u64,
    pub system_prompt_allocation: u64,
    pub safety_margin: f64,
    pub current_usage: u64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            total_capacity: 200_000,
            system_prompt_allocation: 5_000,
            safety_margin: 0.20,
            current_usage: 0,
        }
    }
}

impl ContextBudget {
    pub fn with_capacity(total_capacity: u64) -> Self {
        Self {
            total_capacity,
            ..Self::default()
        }
    }

    pub fn effective_capacity(&self) -> u64 {
        (self.total_capacity as f64 * (1.0 - self.safety_margin)) as u64
    }

    pub fn smart_zone_max(&self) -> u64 {
        (self.total_capacity as f64 * 0.60) as u64
    }

    pub fn available_tokens(&self) -> u64 {
        self.effective_capacity().saturating_sub(self.current_usage)
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        self.current_usage as f64 / self.total_capacity as f64 * 100.0
    }

    pub fn should_handoff(&self) -> bool {
        self.current_usage >= self.smart_zone_max()
    }

    pub fn add_usage(&mut self, tokens: u64) {
        self.current_usage += tokens;
    }

    pub fn reset(&mut self) {
        self.current_usage = 0;
    }
}

/// Phase completion signal set by the signal tool; the orchestrator checks
/// it in the phase completion predicate instead of parsing LLM text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub complete: bool,
    pub summary: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryUpdateMode {
    Replace,
    Append,
}

/// Kind of session note recorded via the session-note tool. Each kind
/// feeds its own section of the MEMORY.md hand-off rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionNoteKind {
    ArchitecturalDecision,
    FileModified,
    NoteForNext,
}

impl fmt::Display for SessionNoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionNoteKind::ArchitecturalDecision => "architectural_decision",
            SessionNoteKind::FileModified => "file_modified",
            SessionNoteKind::NoteForNext => "note_for_next",
        };
        write!(f, "{}", s)
    }
}

/// Memory update queued by the executor via the update-memory tool and
/// flushed by the orchestrator at iteration end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    pub content: String,
    pub mode: MemoryUpdateMode,
    pub timestamp: DateTime<Utc>,
}

/// Root orchestrator record, persisted to `.ralph/state.json`. Survives
/// context-window resets; the single source of truth for workflow position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphState {
    pub project_root: PathBuf,

    #[serde(default)]
    pub current_phase: Phase,

    #[serde(default)]
    pub iteration_count: u64,

    #[serde(default)]
    pub session_iteration_count: u64,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub total_cost_usd: f64,

    #[serde(default)]
    pub total_tokens_used: u64,

    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerState,

    #[serde(default)]
    pub context_budget: ContextBudget,

    #[serde(default)]
    pub session_cost_usd: f64,

    #[serde(default)]
    pub session_tokens_used: u64,

    #[serde(default)]
    pub tasks_completed_this_session: u32,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub completion_signals: BTreeMap<String, CompletionSignal>,

    #[serde(default)]
    pub pending_memory_update: Option<MemoryUpdate>,

    #[serde(default)]
    pub architectural_decisions: Vec<String>,

    #[serde(default)]
    pub files_modified: Vec<String>,

    #[serde(default)]
    pub notes_for_next: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RalphState {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            project_root: project_root.into(),
            current_phase: Phase::Discovery,
            iteration_count: 0,
            session_iteration_count: 0,
            session_id: None,
            total_cost_usd: 0.0,
            total_tokens_used: 0,
            started_at: now,
            last_activity_at: now,
            circuit_breaker: CircuitBreakerState::default(),
            context_budget: ContextBudget::default(),
            session_cost_usd: 0.0,
            session_tokens_used: 0,
            tasks_completed_this_session: 0,
            paused: false,
            completion_signals: BTreeMap::new(),
            pending_memory_update: None,
            architectural_decisions: Vec::new(),
            files_modified: Vec::new(),
            notes_for_next: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn start_iteration(&mut self) {
        self.iteration_count += 1;
        self.session_iteration_count += 1;
        self.last_activity_at = Utc::now();
    }

    /// Fold one iteration's cost and tokens into the session and lifetime
    /// counters. Circuit-breaker outcomes are recorded separately by the
    /// loop, which knows whether the iteration succeeded; the session task
    /// counter is owned by the tool surface.
    pub fn end_iteration(&mut self, cost_usd: f64, tokens_used: u64) {
        self.total_cost_usd += cost_usd;
        self.total_tokens_used += tokens_used;
        self.session_cost_usd += cost_usd;
        self.session_tokens_used += tokens_used;
        self.last_activity_at = Utc::now();
        self.context_budget.add_usage(tokens_used);
    }

    /// Begin a fresh context window. Session-scoped counters and notes
    /// reset; the project-lifetime counters are untouched.
    pub fn start_new_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
        self.session_cost_usd = 0.0;
        self.session_tokens_used = 0;
        self.tasks_completed_this_session = 0;
        self.session_iteration_count = 0;
        self.context_budget.reset();
        self.architectural_decisions.clear();
        self.files_modified.clear();
        self.notes_for_next.clear();
    }

    /// Record a session note under its kind. File entries are
    /// deduplicated; the same file touched twice lists once.
    pub fn record_session_note(&mut self, kind: SessionNoteKind, content: impl Into<String>) {
        let content = content.into();
        match kind {
            SessionNoteKind::ArchitecturalDecision => {
                self.architectural_decisions.push(content);
            }
            SessionNoteKind::FileModified => {
                if !self.files_modified.contains(&content) {
                    self.files_modified.push(content);
                }
            }
            SessionNoteKind::NoteForNext => {
                self.notes_for_next.push(content);
            }
        }
        self.last_activity_at = Utc::now();
    }

    /// Phase transitions always start with a fresh context budget.
    pub fn advance_phase(&mut self, new_phase: Phase) {
        self.current_phase = new_phase;
        self.last_activity_at = Utc::now();
        self.context_budget.reset();
    }

    pub fn needs_handoff(&self) -> bool {
        self.context_budget.should_handoff()
    }

    pub fn should_halt(&self) -> (bool, Option<String>) {
        self.circuit_breaker.should_halt(self.total_cost_usd)
    }

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.completion_signals
            .get(phase.as_str())
            .map(|s| s.complete)
            .unwrap_or(false)
    }

    pub fn clear_phase_completion(&mut self, phase: Phase) {
        self.completion_signals.remove(phase.as_str());
    }

    pub fn signal_phase_complete(
        &mut self,
        phase: Phase,
        summary: impl Into<String>,
        artifacts: BTreeMap<String, serde_json::Value>,
    ) {
        self.completion_signals.insert(
            phase.as_str().to_string(),
            CompletionSignal {
                complete: true,
                summary: summary.into(),
                artifacts,
                timestamp: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_failure_cap() {
        let mut cb = CircuitBreakerState::default();
        cb.record_failure("boom");
        cb.record_failure("boom");
        assert_eq!(cb.state, CircuitState::Closed);
        cb.record_failure("boom");
        assert_eq!(cb.state, CircuitState::Open);
        assert_eq!(
            cb.should_halt(0.0),
            (true, Some("consecutive_failures:3".to_string()))
        );
    }

    #[test]
    fn test_breaker_below_cap_continues() {
        let mut cb = CircuitBreakerState::default();
        cb.record_failure("boom");
        cb.record_failure("boom");
        assert_eq!(cb.should_halt(0.0), (false, None));
    }

    #[test]
    fn test_breaker_success_resets_failures() {
        let mut cb = CircuitBreakerState::default();
        cb.record_failure("boom");
        cb.record_success(1, true);
        assert_eq!(cb.failure_count, 0);
        assert_eq!(cb.stagnation_count, 0);
    }

    #[test]
    fn test_stagnation_accumulates_without_completions() {
        let mut cb = CircuitBreakerState::default();
        for _ in 0..5 {
            cb.record_success(0, false);
        }
        assert_eq!(cb.stagnation_count, 5);
        assert_eq!(cb.state, CircuitState::Open);
        assert_eq!(cb.should_halt(0.0), (true, Some("stagnation:5".to_string())));
    }

    #[test]
    fn test_cost_limit_halts_at_exact_threshold() {
        let cb = CircuitBreakerState::default();
        assert_eq!(cb.should_halt(99.99), (false, None));
        assert_eq!(
            cb.should_halt(100.0),
            (true, Some("cost_limit:$100.00".to_string()))
        );
    }

    #[test]
    fn test_half_open_transitions() {
        let mut cb = CircuitBreakerState::default();
        for _ in 0..3 {
            cb.record_failure("boom");
        }
        assert_eq!(cb.state, CircuitState::Open);

        cb.resume();
        assert_eq!(cb.state, CircuitState::HalfOpen);

        let mut success_path = cb.clone();
        success_path.record_success(1, true);
        assert_eq!(success_path.state, CircuitState::Closed);

        cb.record_failure("again");
        assert_eq!(cb.state, CircuitState::Open);
    }

    #[test]
    fn test_context_budget_smart_zone() {
        let mut budget = ContextBudget::default();
        assert_eq!(budget.smart_zone_max(), 120_000);
        assert_eq!(budget.effective_capacity(), 160_000);

        budget.add_usage(119_999);
        assert!(!budget.should_handoff());
        budget.add_usage(1);
        assert!(budget.should_handoff());
    }

    #[test]
    fn test_session_counters_bounded_by_totals() {
        let mut state = RalphState::new("/tmp/p");
        state.start_iteration();
        state.end_iteration(1.5, 10_000);
        assert!(state.session_cost_usd <= state.total_cost_usd);
        assert!(state.session_tokens_used <= state.total_tokens_used);

        state.start_new_session("s-2");
        assert_eq!(state.session_cost_usd, 0.0);
        assert_eq!(state.session_tokens_used, 0);
        assert_eq!(state.total_tokens_used, 10_000);
        assert!(state.session_cost_usd <= state.total_cost_usd);
    }

    #[test]
    fn test_iteration_count_monotone() {
        let mut state = RalphState::new("/tmp/p");
        state.start_iteration();
        state.start_new_session("s-2");
        state.start_iteration();
        assert_eq!(state.iteration_count, 2);
        assert_eq!(state.session_iteration_count, 1);
    }

    #[test]
    fn test_session_notes_recorded_and_reset() {
        let mut state = RalphState::new("/tmp/p");
        state.record_session_note(
            SessionNoteKind::ArchitecturalDecision,
            "store is append-only",
        );
        state.record_session_note(SessionNoteKind::FileModified, "src/auth.rs");
        state.record_session_note(SessionNoteKind::FileModified, "src/auth.rs");
        state.record_session_note(SessionNoteKind::NoteForNext, "wire the session layer next");

        assert_eq!(state.architectural_decisions.len(), 1);
        // Duplicate file entries collapse.
        assert_eq!(state.files_modified, vec!["src/auth.rs".to_string()]);
        assert_eq!(state.notes_for_next.len(), 1);

        state.start_new_session("s-2");
        assert!(state.architectural_decisions.is_empty());
        assert!(state.files_modified.is_empty());
        assert!(state.notes_for_next.is_empty());
    }

    #[test]
    fn test_phase_completion_signals() {
        let mut state = RalphState::new("/tmp/p");
        assert!(!state.is_phase_complete(Phase::Discovery));
        state.signal_phase_complete(Phase::Discovery, "requirements captured", BTreeMap::new());
        assert!(state.is_phase_complete(Phase::Discovery));
        state.clear_phase_completion(Phase::Discovery);
        assert!(!state.is_phase_complete(Phase::Discovery));
    }
}
