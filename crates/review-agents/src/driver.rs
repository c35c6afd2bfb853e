//! Async review driver.
//!
//! ## Lifecycle of one operation
//!
//! ```text
//! ReviewDriver::execute(action)
//!   → lock session                   one writer per session
//!   → audit ledgers                  new breach: record, rebase, report
//!   → session.prepare(action)        guards + prompt, no mutation
//!   → gateway.generate(role, hist)   bounded by timeout, cancellable
//!   → session.commit(turn, reply)    append (prompt, reply), apply phase
//!   → store.save(snapshot)           on failure entries stay unpersisted
//! ```
//!
//! [`ReviewDriver::broadcast`] follows the same sequence with both agents
//! called concurrently and both pairs committed together.
//!
//! The lock is held across the whole sequence, so concurrent operations on
//! one session serialise. Separate drivers share nothing and run in
//! parallel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use review_core::review::{
    AgentRole, CommittedTurn, IntegrityBreach, PhaseKind, RefinementCounts, ReviewAction,
    ReviewSession, SessionParams, TransitionError,
};

use crate::errors::ReviewError;
use crate::gateway::{AgentGateway, GatewayError};
use crate::store::SessionStore;

/// Directive sent when the Critic returns an empty critique.
const EMPTY_CRITIQUE_DIRECTIVE: &str = "Your critique was empty. Identify at least one concrete \
flaw, unsupported claim, or logical inconsistency in the review, quoting the passage it concerns.";

/// Outcome of an automatic protocol run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSummary {
    pub session_id: String,
    pub phase: PhaseKind,
    pub primary_entries: usize,
    pub critic_entries: usize,
    pub refinements: RefinementCounts,
    /// Final snapshot bytes, as saved.
    pub snapshot: Vec<u8>,
}

/// Drives one [`ReviewSession`] against a gateway and a store.
#[derive(Clone)]
pub struct ReviewDriver {
    session: Arc<Mutex<ReviewSession>>,
    gateway: Arc<dyn AgentGateway>,
    store: Arc<dyn SessionStore>,
    gateway_timeout: Duration,
    cancel: CancellationToken,
}

impl ReviewDriver {
    pub fn new(
        session: ReviewSession,
        gateway: Arc<dyn AgentGateway>,
        store: Arc<dyn SessionStore>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            gateway,
            store,
            gateway_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Load a stored session.
    ///
    /// Returns the breach found while verifying the loaded ledgers, if any.
    /// The session is usable either way.
    pub async fn open(
        id: &str,
        params: SessionParams,
        gateway: Arc<dyn AgentGateway>,
        store: Arc<dyn SessionStore>,
        gateway_timeout: Duration,
    ) -> Result<(Self, Option<IntegrityBreach>), ReviewError> {
        let bytes = store.load(id).await?;
        let restored = ReviewSession::restore(&bytes, params)?;
        info!(
            session_id = %id,
            phase = %restored.session.phase(),
            breach = restored.breach.is_some(),
            "session loaded"
        );
        let driver = Self::new(restored.session, gateway, store, gateway_timeout);
        Ok((driver, restored.breach))
    }

    /// Token that cancels in-flight and future agent calls.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read the session under the lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&ReviewSession) -> R) -> R {
        let session = self.session.lock().await;
        f(&session)
    }

    pub async fn session_id(&self) -> String {
        self.inspect(|s| s.session_id().to_string()).await
    }

    /// Run one agent-producing operation end to end.
    pub async fn execute(&self, action: ReviewAction) -> Result<CommittedTurn, ReviewError> {
        let mut session = self.session.lock().await;

        if let Err(breach) = session.audit() {
            self.persist_best_effort(&mut session).await;
            return Err(breach.into());
        }

        let turn = session.prepare(action)?;
        let role = turn.role();
        let started = Instant::now();
        let outcome = self.call_gateway(role, &turn).await;
        let response = self
            .settle(&mut session, role, turn.action().name(), started, outcome)
            .await?;

        let committed = session.commit(turn, response, Utc::now())?;
        self.persist(&mut session).await?;
        Ok(committed)
    }

    /// Send one message to both agents concurrently.
    ///
    /// Both (prompt, reply) pairs are recorded only if both calls succeed;
    /// otherwise neither ledger changes. Returns the Primary's turn first.
    pub async fn broadcast(
        &self,
        message: impl Into<String>,
    ) -> Result<[CommittedTurn; 2], ReviewError> {
        let mut session = self.session.lock().await;

        if let Err(breach) = session.audit() {
            self.persist_best_effort(&mut session).await;
            return Err(breach.into());
        }

        let prepared = session.prepare_broadcast(message)?;
        let started = Instant::now();
        let (primary, critic) = tokio::join!(
            self.call_gateway(AgentRole::Primary, prepared.turn(AgentRole::Primary)),
            self.call_gateway(AgentRole::Critic, prepared.turn(AgentRole::Critic)),
        );
        let primary = self
            .settle(&mut session, AgentRole::Primary, "broadcast", started, primary)
            .await;
        let critic = self
            .settle(&mut session, AgentRole::Critic, "broadcast", started, critic)
            .await;

        let committed = session.commit_broadcast(prepared, primary?, critic?, Utc::now())?;
        self.persist(&mut session).await?;
        Ok(committed)
    }

    /// Log an agent call's outcome and halt the session on a fatal error.
    async fn settle(
        &self,
        session: &mut ReviewSession,
        role: AgentRole,
        action: &str,
        started: Instant,
        outcome: Result<String, GatewayError>,
    ) -> Result<String, ReviewError> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(response) => {
                info!(
                    session_id = %session.session_id(),
                    role = %role,
                    action,
                    elapsed_ms,
                    "agent call succeeded"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(
                    session_id = %session.session_id(),
                    role = %role,
                    action,
                    elapsed_ms,
                    error = %e,
                    "agent call failed"
                );
                if e.is_fatal() {
                    session.halt(e.to_string());
                    self.persist_best_effort(session).await;
                }
                Err(ReviewError::gateway(role, e))
            }
        }
    }

    async fn call_gateway(
        &self,
        role: AgentRole,
        turn: &review_core::review::PreparedTurn,
    ) -> Result<String, GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(
                self.gateway_timeout,
                self.gateway.generate(role, turn.history()),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(GatewayError::Timeout {
                    after: self.gateway_timeout,
                }),
            },
        }
    }

    /// Accept the initial review and move to refinement.
    pub async fn accept_draft(&self) -> Result<(), ReviewError> {
        let mut session = self.session.lock().await;
        session.accept_draft()?;
        self.persist(&mut session).await
    }

    /// Seal the session and return the saved snapshot bytes.
    ///
    /// Calling it again returns identical bytes.
    pub async fn finalize(&self) -> Result<Vec<u8>, ReviewError> {
        let mut session = self.session.lock().await;
        session.finalize(Utc::now())?;
        let bytes = session.snapshot()?;
        self.save_bytes(&mut session, &bytes).await?;
        Ok(bytes)
    }

    /// Archive the current generation and start over at `Init`.
    pub async fn reset(&self) -> Result<(), ReviewError> {
        let mut session = self.session.lock().await;
        if session.is_finalized() {
            return Err(TransitionError::SessionFinalized.into());
        }
        // A failed archive write leaves the current generation in place.
        let archived = session.snapshot()?;
        self.store
            .archive(session.session_id(), session.generation(), &archived)
            .await?;
        session.reset()?;
        self.persist(&mut session).await
    }

    /// Save the current snapshot, e.g. to retry after a storage failure.
    pub async fn save(&self) -> Result<(), ReviewError> {
        let mut session = self.session.lock().await;
        self.persist(&mut session).await
    }

    /// Current snapshot bytes, without saving.
    pub async fn snapshot(&self) -> Result<Vec<u8>, ReviewError> {
        let session = self.session.lock().await;
        Ok(session.snapshot()?)
    }

    async fn persist(&self, session: &mut ReviewSession) -> Result<(), ReviewError> {
        let bytes = session.snapshot()?;
        self.save_bytes(session, &bytes).await
    }

    async fn save_bytes(&self, session: &mut ReviewSession, bytes: &[u8]) -> Result<(), ReviewError> {
        match self.store.save(session.session_id(), bytes).await {
            Ok(()) => {
                session.mark_persisted();
                Ok(())
            }
            Err(e) => {
                warn!(
                    session_id = %session.session_id(),
                    unpersisted = session.unpersisted_len(),
                    error = %e,
                    "session save failed"
                );
                Err(e.into())
            }
        }
    }

    async fn persist_best_effort(&self, session: &mut ReviewSession) {
        // Failure is already logged by save_bytes.
        let _ = self.persist(session).await;
    }

    /// Drive the whole protocol from the current phase to `Finalized`.
    ///
    /// Incomplete reviews are refined with a directive naming the missing
    /// items; empty critiques are sent back to the Critic. Stops with an
    /// error when a refinement budget runs out or any operation fails.
    pub async fn run_protocol(&self) -> Result<ProtocolSummary, ReviewError> {
        loop {
            let (phase, directive, critique_blank) = self
                .inspect(|s| {
                    let directive = s
                        .phase()
                        .completeness()
                        .and_then(|report| report.refinement_directive());
                    let critique_blank = s
                        .current_critique()
                        .map_or(true, |c| c.trim().is_empty());
                    (s.phase().kind(), directive, critique_blank)
                })
                .await;

            match phase {
                PhaseKind::Init => {
                    self.execute(ReviewAction::BeginReview).await?;
                }
                PhaseKind::PrimaryReview => self.accept_draft().await?,
                PhaseKind::Refinement => {
                    let action = match directive {
                        Some(directive) => ReviewAction::Refine { directive },
                        None => ReviewAction::SignalSatisfied,
                    };
                    self.execute(action).await?;
                }
                PhaseKind::Vulnerability => {
                    let action = if critique_blank {
                        ReviewAction::RefineCritique {
                            directive: EMPTY_CRITIQUE_DIRECTIVE.to_string(),
                        }
                    } else {
                        ReviewAction::AcceptCritique
                    };
                    self.execute(action).await?;
                }
                PhaseKind::Reflection => {
                    self.finalize().await?;
                }
                PhaseKind::Finalized => break,
            }
        }

        let snapshot = self.finalize().await?;
        let summary = self
            .inspect(|s| ProtocolSummary {
                session_id: s.session_id().to_string(),
                phase: s.phase().kind(),
                primary_entries: s.ledger(AgentRole::Primary).len(),
                critic_entries: s.ledger(AgentRole::Critic).len(),
                refinements: s.refinements(),
                snapshot,
            })
            .await;
        info!(
            session_id = %summary.session_id,
            primary_entries = summary.primary_entries,
            critic_entries = summary.critic_entries,
            primary_refinements = summary.refinements.primary,
            critic_refinements = summary.refinements.critic,
            "protocol complete"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for ReviewDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewDriver")
            .field("gateway_timeout", &self.gateway_timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Whether the protocol stopped because a refinement budget ran out.
pub fn is_refinement_exhausted(err: &ReviewError) -> bool {
    matches!(
        err,
        ReviewError::Transition(TransitionError::RefinementLimit { .. })
    )
}
