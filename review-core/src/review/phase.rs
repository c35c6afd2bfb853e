//! Review phases, the transition table, and transition errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::completeness::{CompletenessReport, MissingItem};
use super::AgentRole;
use crate::ledger::encoding::canonical_time;

/// Fieldless phase discriminant used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Proposal bound, nothing generated yet.
    Init,
    /// Primary has produced the initial structured review.
    PrimaryReview,
    /// Caller-directed revisions of the Primary review.
    Refinement,
    /// Critic is critiquing the current Primary review.
    Vulnerability,
    /// Primary has answered the critique point by point.
    Reflection,
    /// Both ledgers sealed.
    Finalized,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 6] = [
        Self::Init,
        Self::PrimaryReview,
        Self::Refinement,
        Self::Vulnerability,
        Self::Reflection,
        Self::Finalized,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized)
    }

    /// Valid transitions from this phase, including self-loops.
    pub fn successors(self) -> &'static [PhaseKind] {
        match self {
            Self::Init => &[Self::PrimaryReview],
            Self::PrimaryReview => &[Self::Refinement],
            Self::Refinement => &[Self::Refinement, Self::Vulnerability],
            Self::Vulnerability => &[Self::Vulnerability, Self::Reflection],
            Self::Reflection => &[Self::Finalized],
            Self::Finalized => &[],
        }
    }

    /// The next phase in protocol order, ignoring self-loops.
    pub fn forward(self) -> Option<PhaseKind> {
        self.successors().iter().copied().find(|&p| p != self)
    }

    fn ordinal(self) -> usize {
        Self::ALL.iter().position(|&p| p == self).unwrap_or(0)
    }

    /// Whether `to` is reachable in one step.
    pub fn can_transition_to(self, to: PhaseKind) -> bool {
        self.successors().contains(&to)
    }

    /// Check a transition, naming the required intermediate phase when the
    /// caller tries to skip ahead.
    pub fn check_transition(self, to: PhaseKind) -> Result<(), TransitionError> {
        if self.can_transition_to(to) {
            return Ok(());
        }
        if self.is_terminal() {
            return Err(TransitionError::SessionFinalized);
        }
        let required = if to.ordinal() > self.ordinal() {
            self.forward()
        } else {
            None
        };
        Err(TransitionError::InvalidTransition {
            from: self,
            to,
            required,
        })
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::PrimaryReview => write!(f, "primary_review"),
            Self::Refinement => write!(f, "refinement"),
            Self::Vulnerability => write!(f, "vulnerability"),
            Self::Reflection => write!(f, "reflection"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

impl std::str::FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "init" => Ok(Self::Init),
            "primary_review" | "primary" => Ok(Self::PrimaryReview),
            "refinement" | "refine" => Ok(Self::Refinement),
            "vulnerability" => Ok(Self::Vulnerability),
            "reflection" | "judgement" | "judgment" => Ok(Self::Reflection),
            "finalized" | "final" => Ok(Self::Finalized),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Current phase with its per-state data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Init,
    PrimaryReview {
        completeness: CompletenessReport,
    },
    Refinement {
        completeness: CompletenessReport,
    },
    Vulnerability {
        /// Critiques produced so far, including the first.
        critique_rounds: u32,
    },
    Reflection,
    Finalized {
        #[serde(with = "canonical_time")]
        finalized_at: DateTime<Utc>,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Init => PhaseKind::Init,
            Self::PrimaryReview { .. } => PhaseKind::PrimaryReview,
            Self::Refinement { .. } => PhaseKind::Refinement,
            Self::Vulnerability { .. } => PhaseKind::Vulnerability,
            Self::Reflection => PhaseKind::Reflection,
            Self::Finalized { .. } => PhaseKind::Finalized,
        }
    }

    /// Completeness of the latest Primary draft, if this phase tracks one.
    pub fn completeness(&self) -> Option<&CompletenessReport> {
        match self {
            Self::PrimaryReview { completeness } | Self::Refinement { completeness } => {
                Some(completeness)
            }
            _ => None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized { .. })
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind().fmt(f)
    }
}

fn transition_hint(required: &Option<PhaseKind>) -> String {
    match required {
        Some(p) => format!(" (must pass through {p} first)"),
        None => String::new(),
    }
}

fn missing_list(missing: &[MissingItem]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a requested operation could not be applied. The session is left
/// unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition {from} → {to}{}", transition_hint(.required))]
    InvalidTransition {
        from: PhaseKind,
        to: PhaseKind,
        /// Phase that must be entered first, when skipping ahead.
        required: Option<PhaseKind>,
    },

    #[error("review is structurally incomplete: missing {}", missing_list(.missing))]
    StructurallyIncomplete { missing: Vec<MissingItem> },

    #[error("critic critique is empty")]
    EmptyCritique,

    #[error("{role} refinement limit of {limit} reached")]
    RefinementLimit { role: AgentRole, limit: u32 },

    #[error("session is finalized")]
    SessionFinalized,

    #[error("session is halted: {reason}")]
    SessionHalted { reason: String },

    #[error("prepared turn is stale; the session changed since it was prepared")]
    StaleTurn,

    #[error("consult is not available in phase {phase}")]
    ConsultUnavailable { phase: PhaseKind },

    #[error("message is empty")]
    EmptyMessage,
}
