use std::fmt;

use serde::{Deserialize, Serialize};

/// Development lifecycle phases. The orchestrator, not the LLM, decides
/// when a phase is entered or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Discovery,
    Planning,
    Building,
    Validation,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Discovery,
        Phase::Planning,
        Phase::Building,
        Phase::Validation,
    ];

    /// Edges of the transition graph. Back-edges exist only between
    /// building and validation; everything else is forward-only.
    pub fn allowed_transitions(&self) -> &'static [Phase] {
        match self {
            Phase::Discovery => &[Phase::Planning],
            Phase::Planning => &[Phase::Building],
            Phase::Building => &[Phase::Validation],
            Phase::Validation => &[Phase::Building],
        }
    }

    pub fn can_transition_to(&self, target: Phase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// The forward order, used for previous-phase memory lookup.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Discovery => Some(Phase::Planning),
            Phase::Planning => Some(Phase::Building),
            Phase::Building => Some(Phase::Validation),
            Phase::Validation => None,
        }
    }

    pub fn previous(&self) -> Option<Phase> {
        match self {
            Phase::Discovery => None,
            Phase::Planning => Some(Phase::Discovery),
            Phase::Building => Some(Phase::Planning),
            Phase::Validation => Some(Phase::Building),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Planning => "planning",
            Phase::Building => "building",
            Phase::Validation => "validation",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "discovery" => Some(Phase::Discovery),
            "planning" => Some(Phase::Planning),
            "building" => Some(Phase::Building),
            "validation" => Some(Phase::Validation),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
