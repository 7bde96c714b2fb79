use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Phase;

/// Memory captured at the end of every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMemory {
    pub iteration: u64,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub tasks_completed: Vec<String>,
    pub tasks_blocked: Vec<String>,
    pub progress_made: bool,
    pub tokens_used: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Memory captured when a phase completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMemory {
    pub phase: Phase,
    pub completed_at: DateTime<Utc>,
    pub iterations_in_phase: u64,
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    pub summary: String,
}

/// Memory captured at a session hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMemory {
    pub session_id: String,
    pub phase: Phase,
    pub iteration: u64,
    pub handoff_reason: String,
    #[serde(default)]
    pub tasks_in_progress: Vec<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// Counts reported by `ralph memory --stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub iteration_files: usize,
    pub session_files: usize,
    pub phase_files: usize,
    pub archive_files: usize,
    pub total_size_bytes: u64,
}
