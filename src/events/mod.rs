//! Loop lifecycle events.
//!
//! The runner emits typed events at iteration boundaries, phase changes,
//! hand-offs, and halts. Sinks are synchronous observers (terminal
//! rendering, log files); they never influence control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Phase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    IterationStarted {
        iteration: u64,
        phase: Phase,
        task_id: Option<String>,
    },
    IterationFinished {
        iteration: u64,
        phase: Phase,
        success: bool,
        task_completed: bool,
        cost_usd: f64,
        tokens_used: u64,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    HandoffStarted {
        session_id: String,
        reason: String,
    },
    HandoffFinished {
        next_session_id: String,
    },
    Halted {
        reason: String,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::IterationStarted { .. } => "iteration.started",
            RunEvent::IterationFinished { .. } => "iteration.finished",
            RunEvent::PhaseChanged { .. } => "phase.changed",
            RunEvent::HandoffStarted { .. } => "handoff.started",
            RunEvent::HandoffFinished { .. } => "handoff.finished",
            RunEvent::Halted { .. } => "halted",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RunEvent::Halted { .. }
                | RunEvent::IterationFinished { success: false, .. }
        )
    }
}

/// Timestamped envelope delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl EventEnvelope {
    pub fn new(event: RunEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Observer of run events.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _envelope: &EventEnvelope) {}
}

/// Collects events in memory; used by tests and the status renderer.
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<EventEnvelope>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.lock().unwrap().push(envelope.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = RunEvent::PhaseChanged {
            from: Phase::Planning,
            to: Phase::Building,
        };
        assert_eq!(event.name(), "phase.changed");
        assert!(!event.is_error());

        let halted = RunEvent::Halted {
            reason: "stagnation:5".to_string(),
        };
        assert!(halted.is_error());
    }

    #[test]
    fn test_collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        sink.emit(&EventEnvelope::new(RunEvent::IterationStarted {
            iteration: 1,
            phase: Phase::Building,
            task_id: Some("A".to_string()),
        }));
        sink.emit(&EventEnvelope::new(RunEvent::Halted {
            reason: "cancelled".to_string(),
        }));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.name(), "iteration.started");
        assert_eq!(events[1].event.name(), "halted");
    }

    #[test]
    fn test_envelope_serializes_flat() {
        let envelope = EventEnvelope::new(RunEvent::HandoffStarted {
            session_id: "s-1-abc".to_string(),
            reason: "context_budget".to_string(),
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "handoff_started");
        assert_eq!(json["reason"], "context_budget");
        assert!(json["at"].is_string());
    }
}
