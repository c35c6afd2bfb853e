//! "Flaws of Others" review protocol: phases, completeness policy,
//! prompts, and the session that sequences the two agents.

pub mod completeness;
pub mod phase;
pub mod prompt;
pub mod session;
pub mod snapshot;

use serde::{Deserialize, Serialize};

pub use completeness::{
    check_completeness, BalanceAdvisory, CompletenessReport, CriteriaError, CriteriaSet,
    CriterionCoverage, MissingItem, Polarity, DEFAULT_CRITERIA,
};
pub use phase::{Phase, PhaseKind, TransitionError};
pub use prompt::{PromptTemplates, TemplateError, TemplateKind, PROMPT_VERSION};
pub use session::{
    CommittedTurn, IntegrityBreach, PreparedBroadcast, PreparedTurn, RefinementCounts, RefinementLimits,
    ReviewAction, ReviewSession, SessionParams,
};
pub use snapshot::{Restored, SessionSnapshot, SnapshotError};

/// One of the two collaborating agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Writes and revises the review.
    Primary,
    /// Critiques the Primary's review.
    Critic,
}

impl AgentRole {
    pub const ALL: [AgentRole; 2] = [Self::Primary, Self::Critic];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Critic => "critic",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Critic,
            Self::Critic => Self::Primary,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "critic" => Ok(Self::Critic),
            other => Err(format!("unknown role: {other} (expected primary or critic)")),
        }
    }
}
