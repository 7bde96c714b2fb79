use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;

/// Origin of a queued context snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSource {
    #[default]
    User,
    System,
    TestFailure,
}

impl fmt::Display for InjectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InjectionSource::User => "user",
            InjectionSource::System => "system",
            InjectionSource::TestFailure => "test_failure",
        };
        write!(f, "{}", s)
    }
}

/// A context snippet queued for the next iteration's prompt. Consumed in
/// one iteration, then deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub source: InjectionSource,
    #[serde(default)]
    pub priority: i64,
}

impl Injection {
    pub fn new(content: impl Into<String>, source: InjectionSource, priority: i64) -> Self {
        Self {
            timestamp: Utc::now(),
            content: content.into(),
            source,
            priority,
        }
    }

    /// Higher priority first, then oldest first.
    pub fn sort(injections: &mut [Injection]) {
        injections.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
    }
}

/// One row of `.ralph/session_history/sessions.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub session_id: String,
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub tasks_completed: u32,
    pub phase: Phase,
    pub handoff_reason: String,
}
