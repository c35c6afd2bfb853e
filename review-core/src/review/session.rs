//! Review session: owns both ledgers and drives the phase machine.
//!
//! Every agent-producing operation is split into [`ReviewSession::prepare`],
//! which checks guards and renders the prompt without touching state, and
//! [`ReviewSession::commit`], which records the `(prompt, response)` pair and
//! applies the transition. Callers talk to the agent between the two, so a
//! failed call leaves the session exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::completeness::{check_completeness, CompletenessReport, CriteriaSet};
use super::phase::{Phase, PhaseKind, TransitionError};
use super::prompt::{PromptTemplates, TemplateKind};
use super::AgentRole;
use crate::ledger::{BrokenLink, ChatMessage, EntryRole, Ledger, LedgerEntry, GENESIS_HASH};

/// Refinements performed so far, per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementCounts {
    pub primary: u32,
    pub critic: u32,
}

/// Upper bounds on the refinement self-loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementLimits {
    pub max_primary: u32,
    pub max_critic: u32,
}

impl Default for RefinementLimits {
    fn default() -> Self {
        Self {
            max_primary: 5,
            max_critic: 3,
        }
    }
}

/// Runtime parameters that are not part of the persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub templates: PromptTemplates,
    pub limits: RefinementLimits,
}

/// A broken chain link found in one role's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("integrity breach in {role} ledger: {link}")]
pub struct IntegrityBreach {
    pub role: AgentRole,
    pub link: BrokenLink,
    /// Ledger length when the breach was found. Entries from here on chain
    /// from `anchor`.
    pub detected_at_len: usize,
    /// Hash the ledger was rebased onto.
    pub anchor: String,
}

/// An operation that asks an agent for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    /// Primary writes the initial structured review.
    BeginReview,
    /// Primary revises its review following `directive`.
    Refine { directive: String },
    /// Caller is satisfied with the review; Critic critiques it.
    SignalSatisfied,
    /// Critic revises its critique following `directive`.
    RefineCritique { directive: String },
    /// Critique accepted; Primary reflects on it point by point.
    AcceptCritique,
    /// Free-form message to one agent outside the protocol.
    Consult { role: AgentRole, message: String },
}

impl ReviewAction {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::BeginReview | Self::Refine { .. } | Self::AcceptCritique => AgentRole::Primary,
            Self::SignalSatisfied | Self::RefineCritique { .. } => AgentRole::Critic,
            Self::Consult { role, .. } => *role,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BeginReview => "begin_review",
            Self::Refine { .. } => "refine",
            Self::SignalSatisfied => "signal_satisfied",
            Self::RefineCritique { .. } => "refine_critique",
            Self::AcceptCritique => "accept_critique",
            Self::Consult { .. } => "consult",
        }
    }

    /// Phases the action may start from.
    fn sources(&self) -> &'static [PhaseKind] {
        match self {
            Self::BeginReview => &[PhaseKind::Init],
            Self::Refine { .. } => &[PhaseKind::PrimaryReview, PhaseKind::Refinement],
            Self::SignalSatisfied => &[PhaseKind::Refinement],
            Self::RefineCritique { .. } | Self::AcceptCritique => &[PhaseKind::Vulnerability],
            Self::Consult { .. } => &[
                PhaseKind::PrimaryReview,
                PhaseKind::Refinement,
                PhaseKind::Vulnerability,
                PhaseKind::Reflection,
            ],
        }
    }

    /// Phase the action leads to. `None` for actions that never change phase.
    fn target(&self) -> Option<PhaseKind> {
        match self {
            Self::BeginReview => Some(PhaseKind::PrimaryReview),
            Self::Refine { .. } => Some(PhaseKind::Refinement),
            Self::SignalSatisfied | Self::RefineCritique { .. } => Some(PhaseKind::Vulnerability),
            Self::AcceptCritique => Some(PhaseKind::Reflection),
            Self::Consult { .. } => None,
        }
    }
}

/// A validated turn, ready to send to the agent.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    action: ReviewAction,
    prompt: String,
    history: Vec<ChatMessage>,
    from: PhaseKind,
    to: PhaseKind,
    generation: u32,
    ledger_lens: [usize; 2],
}

impl PreparedTurn {
    pub fn action(&self) -> &ReviewAction {
        &self.action
    }

    pub fn role(&self) -> AgentRole {
        self.action.role()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The role's recorded conversation followed by the new prompt.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn from(&self) -> PhaseKind {
        self.from
    }

    pub fn to(&self) -> PhaseKind {
        self.to
    }
}

/// One message for both agents, prepared as a turn per role.
#[derive(Debug, Clone)]
pub struct PreparedBroadcast {
    primary: PreparedTurn,
    critic: PreparedTurn,
}

impl PreparedBroadcast {
    pub fn turn(&self, role: AgentRole) -> &PreparedTurn {
        match role {
            AgentRole::Primary => &self.primary,
            AgentRole::Critic => &self.critic,
        }
    }
}

/// What a commit recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTurn {
    pub role: AgentRole,
    pub prompt_entry: LedgerEntry,
    pub response_entry: LedgerEntry,
    pub from: PhaseKind,
    pub to: PhaseKind,
}

/// One review of one proposal by a Primary and a Critic agent.
#[derive(Debug, Clone)]
pub struct ReviewSession {
    pub(crate) session_id: String,
    pub(crate) phase: Phase,
    pub(crate) proposal_ref: String,
    pub(crate) criteria: CriteriaSet,
    pub(crate) refinements: RefinementCounts,
    pub(crate) integrity_breaches: Vec<IntegrityBreach>,
    pub(crate) halted: Option<String>,
    pub(crate) generation: u32,
    pub(crate) primary_ledger: Ledger,
    pub(crate) critic_ledger: Ledger,
    /// Primary ledger index of the agent entry holding the current review.
    pub(crate) current_draft_index: Option<u64>,
    /// Critic ledger index of the agent entry holding the current critique.
    pub(crate) current_critique_index: Option<u64>,
    pub(crate) params: SessionParams,
}

impl ReviewSession {
    /// Create a session with a fresh UUID.
    pub fn new(proposal_ref: impl Into<String>, criteria: CriteriaSet, params: SessionParams) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), proposal_ref, criteria, params)
    }

    pub fn with_id(
        session_id: impl Into<String>,
        proposal_ref: impl Into<String>,
        criteria: CriteriaSet,
        params: SessionParams,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            phase: Phase::Init,
            proposal_ref: proposal_ref.into(),
            criteria,
            refinements: RefinementCounts::default(),
            integrity_breaches: Vec::new(),
            halted: None,
            generation: 0,
            primary_ledger: Ledger::new(),
            critic_ledger: Ledger::new(),
            current_draft_index: None,
            current_critique_index: None,
            params,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn proposal_ref(&self) -> &str {
        &self.proposal_ref
    }

    pub fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    pub fn refinements(&self) -> RefinementCounts {
        self.refinements
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn set_params(&mut self, params: SessionParams) {
        self.params = params;
    }

    /// First breach ever recorded. Sticky across saves and reloads.
    pub fn integrity_breach(&self) -> Option<&IntegrityBreach> {
        self.integrity_breaches.first()
    }

    pub fn integrity_breaches(&self) -> &[IntegrityBreach] {
        &self.integrity_breaches
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.phase.is_finalized()
    }

    pub fn ledger(&self, role: AgentRole) -> &Ledger {
        match role {
            AgentRole::Primary => &self.primary_ledger,
            AgentRole::Critic => &self.critic_ledger,
        }
    }

    pub(crate) fn ledger_mut(&mut self, role: AgentRole) -> &mut Ledger {
        match role {
            AgentRole::Primary => &mut self.primary_ledger,
            AgentRole::Critic => &mut self.critic_ledger,
        }
    }

    /// The Primary's current review text.
    pub fn current_draft(&self) -> Option<&str> {
        self.current_draft_index
            .and_then(|i| self.primary_ledger.get(i as usize))
            .map(|e| e.content.as_str())
    }

    /// The Critic's current critique text.
    pub fn current_critique(&self) -> Option<&str> {
        self.current_critique_index
            .and_then(|i| self.critic_ledger.get(i as usize))
            .map(|e| e.content.as_str())
    }

    /// Completeness of the current draft, evaluated on demand.
    pub fn draft_completeness(&self) -> Option<CompletenessReport> {
        self.current_draft()
            .map(|draft| check_completeness(draft, &self.criteria))
    }

    /// Mark both ledgers as durably stored.
    pub fn mark_persisted(&mut self) {
        self.primary_ledger.mark_persisted();
        self.critic_ledger.mark_persisted();
    }

    /// Number of entries not yet durably stored, across both ledgers.
    pub fn unpersisted_len(&self) -> usize {
        self.primary_ledger.unpersisted().len() + self.critic_ledger.unpersisted().len()
    }

    /// Verify both ledgers.
    ///
    /// A breach not seen before is recorded, the ledger is rebased so new
    /// entries chain from the last verified one, and the breach is returned.
    /// Breaches already recorded are not reported again, but entries
    /// appended after a rebase keep being checked against its anchor.
    pub fn audit(&mut self) -> Result<(), IntegrityBreach> {
        let mut first_new = None;
        for role in AgentRole::ALL {
            let Some((link, anchor)) = self.first_unrecorded_break(role) else {
                continue;
            };
            let breach = IntegrityBreach {
                role,
                link,
                detected_at_len: self.ledger(role).len(),
                anchor: anchor.clone(),
            };
            tracing::warn!(
                session_id = %self.session_id,
                role = %role,
                index = link.index,
                kind = %link.kind,
                "ledger integrity breach"
            );
            self.ledger_mut(role).rebase_to(anchor);
            self.integrity_breaches.push(breach.clone());
            if first_new.is_none() {
                first_new = Some(breach);
            }
        }
        match first_new {
            Some(breach) => Err(breach),
            None => Ok(()),
        }
    }

    /// Rebase points of `role`'s ledger as `(start, anchor)`, ascending.
    ///
    /// The first segment starts at genesis. When several breaches share a
    /// start, the latest rebase wins.
    fn segments(&self, role: AgentRole) -> Vec<(usize, &str)> {
        let mut cuts: Vec<(usize, &str)> = vec![(0, GENESIS_HASH)];
        let mut recorded: Vec<&IntegrityBreach> = self
            .integrity_breaches
            .iter()
            .filter(|b| b.role == role)
            .collect();
        recorded.sort_by_key(|b| b.detected_at_len);
        for breach in recorded {
            match cuts.last_mut() {
                Some(last) if last.0 == breach.detected_at_len => last.1 = &breach.anchor,
                _ => cuts.push((breach.detected_at_len, &breach.anchor)),
            }
        }
        cuts
    }

    /// First break in `role`'s ledger that no recorded breach accounts for,
    /// with the hash to rebase onto.
    ///
    /// Each segment is verified from its own anchor. A segment whose first
    /// break is already recorded is not inspected past it.
    fn first_unrecorded_break(&self, role: AgentRole) -> Option<(BrokenLink, String)> {
        let ledger = self.ledger(role);
        let segments = self.segments(role);
        for (i, &(start, anchor)) in segments.iter().enumerate() {
            let end = segments.get(i + 1).map_or(ledger.len(), |next| next.0);
            let Err(link) = ledger.verify_segment(start, end, anchor) else {
                continue;
            };
            let known = self
                .integrity_breaches
                .iter()
                .any(|b| b.role == role && b.link.index == link.index);
            if known {
                continue;
            }
            let rebase_onto = if link.index as usize > start {
                ledger.hash_before(link.index)
            } else {
                anchor.to_string()
            };
            return Some((link, rebase_onto));
        }
        None
    }

    /// Re-anchor ledgers that have not grown since their latest rebase.
    pub(crate) fn reapply_rebases(&mut self) {
        for role in AgentRole::ALL {
            let pending = self
                .segments(role)
                .last()
                .filter(|(start, _)| *start > 0 && self.ledger(role).len() == *start)
                .map(|(_, anchor)| anchor.to_string());
            if let Some(anchor) = pending {
                self.ledger_mut(role).rebase_to(anchor);
            }
        }
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if let Some(reason) = &self.halted {
            return Err(TransitionError::SessionHalted {
                reason: reason.clone(),
            });
        }
        if self.phase.is_finalized() {
            return Err(TransitionError::SessionFinalized);
        }
        Ok(())
    }

    /// Validate `action` against the current phase and render its prompt.
    ///
    /// Never mutates the session.
    pub fn prepare(&self, action: ReviewAction) -> Result<PreparedTurn, TransitionError> {
        self.ensure_live()?;
        let from = self.phase.kind();

        let to = match action.target() {
            Some(to) if !action.sources().contains(&from) => {
                from.check_transition(to)?;
                return Err(TransitionError::InvalidTransition {
                    from,
                    to,
                    required: None,
                });
            }
            Some(to) => to,
            None if !action.sources().contains(&from) => {
                return Err(TransitionError::ConsultUnavailable { phase: from });
            }
            None => from,
        };

        let limits = self.params.limits;
        let templates = &self.params.templates;
        let prompt = match &action {
            ReviewAction::BeginReview => {
                let criteria = self.criteria.as_prompt_list();
                templates.render(
                    TemplateKind::InitialReview,
                    &[
                        ("proposal", self.proposal_ref.as_str()),
                        ("criteria", criteria.as_str()),
                    ],
                )
            }
            ReviewAction::Refine { directive } => {
                if self.refinements.primary >= limits.max_primary {
                    return Err(TransitionError::RefinementLimit {
                        role: AgentRole::Primary,
                        limit: limits.max_primary,
                    });
                }
                non_blank(directive)?;
                templates.render(TemplateKind::Refinement, &[("directive", directive.as_str())])
            }
            ReviewAction::SignalSatisfied => {
                if let Some(report) = self.phase.completeness() {
                    if !report.is_complete() {
                        return Err(TransitionError::StructurallyIncomplete {
                            missing: report.missing(),
                        });
                    }
                }
                let draft = self.current_draft().unwrap_or_default();
                templates.render(TemplateKind::Vulnerability, &[("draft", draft)])
            }
            ReviewAction::RefineCritique { directive } => {
                if self.refinements.critic >= limits.max_critic {
                    return Err(TransitionError::RefinementLimit {
                        role: AgentRole::Critic,
                        limit: limits.max_critic,
                    });
                }
                non_blank(directive)?;
                templates.render(
                    TemplateKind::CriticRefinement,
                    &[("directive", directive.as_str())],
                )
            }
            ReviewAction::AcceptCritique => {
                let critique = self.current_critique().unwrap_or_default();
                if critique.trim().is_empty() {
                    return Err(TransitionError::EmptyCritique);
                }
                templates.render(TemplateKind::Reflection, &[("critique", critique)])
            }
            ReviewAction::Consult { message, .. } => {
                non_blank(message)?;
                message.clone()
            }
        };

        let mut history = self.ledger(action.role()).history();
        history.push(ChatMessage::user(prompt.clone()));

        Ok(PreparedTurn {
            action,
            prompt,
            history,
            from,
            to,
            generation: self.generation,
            ledger_lens: [self.primary_ledger.len(), self.critic_ledger.len()],
        })
    }

    /// Record the agent's response to a prepared turn and apply its
    /// transition.
    pub fn commit(
        &mut self,
        turn: PreparedTurn,
        response: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CommittedTurn, TransitionError> {
        self.ensure_live()?;
        self.check_fresh(&turn)?;
        Ok(self.record(turn, response.into(), now))
    }

    fn check_fresh(&self, turn: &PreparedTurn) -> Result<(), TransitionError> {
        let current = [self.primary_ledger.len(), self.critic_ledger.len()];
        if turn.generation != self.generation
            || turn.from != self.phase.kind()
            || turn.ledger_lens != current
        {
            return Err(TransitionError::StaleTurn);
        }
        Ok(())
    }

    /// Append a checked turn's pair and apply its phase effect.
    fn record(
        &mut self,
        turn: PreparedTurn,
        response: String,
        now: DateTime<Utc>,
    ) -> CommittedTurn {
        let role = turn.role();
        let ledger = self.ledger_mut(role);
        let prompt_entry = ledger.append(EntryRole::User, turn.prompt, now);
        let response_entry = ledger.append(EntryRole::Agent, response, now);
        let response_index = response_entry.index;

        match turn.action {
            ReviewAction::BeginReview => {
                let completeness = check_completeness(&response_entry.content, &self.criteria);
                self.current_draft_index = Some(response_index);
                self.phase = Phase::PrimaryReview { completeness };
            }
            ReviewAction::Refine { .. } => {
                let completeness = check_completeness(&response_entry.content, &self.criteria);
                self.refinements.primary += 1;
                self.current_draft_index = Some(response_index);
                self.phase = Phase::Refinement { completeness };
            }
            ReviewAction::SignalSatisfied => {
                self.current_critique_index = Some(response_index);
                self.phase = Phase::Vulnerability { critique_rounds: 1 };
            }
            ReviewAction::RefineCritique { .. } => {
                let rounds = match self.phase {
                    Phase::Vulnerability { critique_rounds } => critique_rounds,
                    _ => 0,
                };
                self.refinements.critic += 1;
                self.current_critique_index = Some(response_index);
                self.phase = Phase::Vulnerability {
                    critique_rounds: rounds + 1,
                };
            }
            ReviewAction::AcceptCritique => {
                self.current_draft_index = Some(response_index);
                self.phase = Phase::Reflection;
            }
            ReviewAction::Consult { .. } => {}
        }

        if turn.action.target().is_some() {
            tracing::info!(
                session_id = %self.session_id,
                from = %turn.from,
                to = %turn.to,
                role = %role,
                "phase transition"
            );
        } else {
            tracing::debug!(
                session_id = %self.session_id,
                phase = %turn.from,
                role = %role,
                "turn recorded"
            );
        }

        CommittedTurn {
            role,
            prompt_entry,
            response_entry,
            from: turn.from,
            to: turn.to,
        }
    }

    /// Validate a message for both agents and render one turn per role.
    ///
    /// Allowed wherever a consult is. Never mutates the session.
    pub fn prepare_broadcast(
        &self,
        message: impl Into<String>,
    ) -> Result<PreparedBroadcast, TransitionError> {
        let message = message.into();
        let primary = self.prepare(ReviewAction::Consult {
            role: AgentRole::Primary,
            message: message.clone(),
        })?;
        let critic = self.prepare(ReviewAction::Consult {
            role: AgentRole::Critic,
            message,
        })?;
        Ok(PreparedBroadcast { primary, critic })
    }

    /// Record both replies to a broadcast, or neither.
    pub fn commit_broadcast(
        &mut self,
        prepared: PreparedBroadcast,
        primary_response: impl Into<String>,
        critic_response: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<[CommittedTurn; 2], TransitionError> {
        self.ensure_live()?;
        self.check_fresh(&prepared.primary)?;
        self.check_fresh(&prepared.critic)?;
        let primary = self.record(prepared.primary, primary_response.into(), now);
        let critic = self.record(prepared.critic, critic_response.into(), now);
        Ok([primary, critic])
    }

    /// Prepare and commit in one step, for callers that already hold the
    /// agent's response.
    pub fn advance(
        &mut self,
        action: ReviewAction,
        response: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CommittedTurn, TransitionError> {
        let turn = self.prepare(action)?;
        self.commit(turn, response, now)
    }

    /// Accept the initial review as the starting point for refinement.
    pub fn accept_draft(&mut self) -> Result<(), TransitionError> {
        self.ensure_live()?;
        let Phase::PrimaryReview { completeness } = &self.phase else {
            let from = self.phase.kind();
            from.check_transition(PhaseKind::Refinement)?;
            return Err(TransitionError::InvalidTransition {
                from,
                to: PhaseKind::Refinement,
                required: None,
            });
        };
        let completeness = completeness.clone();
        self.phase = Phase::Refinement { completeness };
        tracing::info!(
            session_id = %self.session_id,
            from = %PhaseKind::PrimaryReview,
            to = %PhaseKind::Refinement,
            "phase transition"
        );
        Ok(())
    }

    /// Seal the session. Finalizing a finalized session changes nothing.
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.phase.is_finalized() {
            return Ok(());
        }
        if let Some(reason) = &self.halted {
            return Err(TransitionError::SessionHalted {
                reason: reason.clone(),
            });
        }
        self.phase.kind().check_transition(PhaseKind::Finalized)?;
        self.phase = Phase::Finalized { finalized_at: now };
        tracing::info!(
            session_id = %self.session_id,
            from = %PhaseKind::Reflection,
            to = %PhaseKind::Finalized,
            primary_entries = self.primary_ledger.len(),
            critic_entries = self.critic_ledger.len(),
            "phase transition"
        );
        Ok(())
    }

    /// Refuse every further operation on this session.
    pub fn halt(&mut self, reason: impl Into<String>) {
        if self.halted.is_none() {
            let reason = reason.into();
            tracing::warn!(session_id = %self.session_id, reason = %reason, "session halted");
            self.halted = Some(reason);
        }
    }

    /// Start over with empty ledgers at `Init`, returning the prior state
    /// for archiving.
    ///
    /// Clears a halt. A finalized session cannot be reset.
    pub fn reset(&mut self) -> Result<ReviewSession, TransitionError> {
        if self.phase.is_finalized() {
            return Err(TransitionError::SessionFinalized);
        }
        let mut fresh = Self::with_id(
            self.session_id.clone(),
            self.proposal_ref.clone(),
            self.criteria.clone(),
            self.params.clone(),
        );
        fresh.generation = self.generation + 1;
        let prior = std::mem::replace(self, fresh);
        tracing::info!(
            session_id = %self.session_id,
            generation = self.generation,
            archived_entries = prior.primary_ledger.len() + prior.critic_ledger.len(),
            "session reset"
        );
        Ok(prior)
    }
}

fn non_blank(text: &str) -> Result<(), TransitionError> {
    if text.trim().is_empty() {
        Err(TransitionError::EmptyMessage)
    } else {
        Ok(())
    }
}
