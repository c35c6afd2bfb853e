//! Versioned session snapshots.
//!
//! A snapshot is pretty-printed JSON with a fixed field order, so saving an
//! unchanged session always yields the same bytes. Restoring re-verifies
//! both ledgers and reports any breach instead of silently accepting it.

use serde::{Deserialize, Serialize};

use super::completeness::CriteriaSet;
use super::phase::Phase;
use super::session::{IntegrityBreach, RefinementCounts, ReviewSession, SessionParams};
use crate::ledger::Ledger;

/// Serialized form of a [`ReviewSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub session_id: String,
    pub phase: Phase,
    pub proposal_ref: String,
    pub criteria: CriteriaSet,
    pub refinements: RefinementCounts,
    #[serde(default)]
    pub integrity_breaches: Vec<IntegrityBreach>,
    #[serde(default)]
    pub halted: Option<String>,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub current_draft_index: Option<u64>,
    #[serde(default)]
    pub current_critique_index: Option<u64>,
    pub primary_ledger: Ledger,
    pub critic_ledger: Ledger,
}

/// Error encoding or decoding a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot serialize failed: {reason}")]
    Serialize { reason: String },

    /// Bytes are not a readable snapshot.
    #[error("snapshot corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// A session rebuilt from a snapshot.
#[derive(Debug, Clone)]
pub struct Restored {
    pub session: ReviewSession,
    /// Breach found while verifying the loaded ledgers, if not already
    /// recorded in the snapshot.
    pub breach: Option<IntegrityBreach>,
}

impl SessionSnapshot {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Capture the persistent state of a session.
    pub fn capture(session: &ReviewSession) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            session_id: session.session_id.clone(),
            phase: session.phase.clone(),
            proposal_ref: session.proposal_ref.clone(),
            criteria: session.criteria.clone(),
            refinements: session.refinements,
            integrity_breaches: session.integrity_breaches.clone(),
            halted: session.halted.clone(),
            generation: session.generation,
            current_draft_index: session.current_draft_index,
            current_critique_index: session.current_critique_index,
            primary_ledger: session.primary_ledger.clone(),
            critic_ledger: session.critic_ledger.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec_pretty(self).map_err(|e| SnapshotError::Serialize {
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_slice(bytes).map_err(|e| SnapshotError::Corrupt {
            reason: e.to_string(),
        })?;
        if snapshot.version != Self::CURRENT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    /// Rebuild the session. Ledgers are taken as stored; breaches recorded
    /// before the save are re-anchored.
    pub fn into_session(self, params: SessionParams) -> ReviewSession {
        let mut session = ReviewSession {
            session_id: self.session_id,
            phase: self.phase,
            proposal_ref: self.proposal_ref,
            criteria: self.criteria,
            refinements: self.refinements,
            integrity_breaches: self.integrity_breaches,
            halted: self.halted,
            generation: self.generation,
            primary_ledger: self.primary_ledger,
            critic_ledger: self.critic_ledger,
            current_draft_index: self.current_draft_index,
            current_critique_index: self.current_critique_index,
            params,
        };
        session.reapply_rebases();
        session
    }
}

impl ReviewSession {
    /// Encode the session as snapshot bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        SessionSnapshot::capture(self).to_bytes()
    }

    /// Decode snapshot bytes and verify both ledgers.
    ///
    /// Loaded entries count as persisted.
    pub fn restore(bytes: &[u8], params: SessionParams) -> Result<Restored, SnapshotError> {
        let mut session = SessionSnapshot::from_bytes(bytes)?.into_session(params);
        session.mark_persisted();
        let breach = session.audit().err();
        if let Some(breach) = &breach {
            tracing::warn!(
                session_id = %session.session_id(),
                %breach,
                "snapshot loaded with broken ledger"
            );
        }
        Ok(Restored { session, breach })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{AgentRole, PhaseKind, ReviewAction};
    use chrono::{TimeZone, Utc};

    fn session_in_refinement() -> ReviewSession {
        let mut s = ReviewSession::with_id(
            "snap-1",
            "proposal",
            CriteriaSet::new(["Approach"]).unwrap(),
            SessionParams::default(),
        );
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        s.advance(
            ReviewAction::BeginReview,
            "## Approach\n- Strength: a\n- Weakness: b\n",
            now,
        )
        .unwrap();
        s.accept_draft().unwrap();
        s
    }

    #[test]
    fn test_round_trip_keeps_phase_and_hashes() {
        let s = session_in_refinement();
        let bytes = s.snapshot().unwrap();
        let restored = ReviewSession::restore(&bytes, SessionParams::default()).unwrap();
        assert!(restored.breach.is_none());
        let back = restored.session;
        assert_eq!(back.phase(), s.phase());
        assert_eq!(
            back.ledger(AgentRole::Primary).entries(),
            s.ledger(AgentRole::Primary).entries()
        );
        assert_eq!(back.current_draft(), s.current_draft());
        assert_eq!(back.snapshot().unwrap(), bytes);
        assert_eq!(back.unpersisted_len(), 0);
    }

    #[test]
    fn test_resave_is_byte_identical() {
        let s = session_in_refinement();
        assert_eq!(s.snapshot().unwrap(), s.snapshot().unwrap());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = ReviewSession::restore(b"{not json", SessionParams::default()).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
    }

    #[test]
    fn test_future_version_rejected() {
        let s = session_in_refinement();
        let mut value: serde_json::Value = serde_json::from_slice(&s.snapshot().unwrap()).unwrap();
        value["version"] = serde_json::json!(2);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_eq!(
            ReviewSession::restore(&bytes, SessionParams::default()).unwrap_err(),
            SnapshotError::VersionMismatch {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_tampered_snapshot_is_flagged_not_accepted() {
        let s = session_in_refinement();
        let mut value: serde_json::Value = serde_json::from_slice(&s.snapshot().unwrap()).unwrap();
        value["primary_ledger"][0]["content"] = serde_json::json!("edited prompt");
        let bytes = serde_json::to_vec(&value).unwrap();

        let restored = ReviewSession::restore(&bytes, SessionParams::default()).unwrap();
        let breach = restored.breach.unwrap();
        assert_eq!(breach.role, AgentRole::Primary);
        assert_eq!(breach.link.index, 0);
        assert_eq!(restored.session.integrity_breach(), Some(&breach));
        assert_eq!(restored.session.phase().kind(), PhaseKind::Refinement);

        // Saved again and reloaded, the breach is remembered, not re-reported.
        let resaved = restored.session.snapshot().unwrap();
        let again = ReviewSession::restore(&resaved, SessionParams::default()).unwrap();
        assert!(again.breach.is_none());
        assert_eq!(again.session.integrity_breach(), Some(&breach));
        assert_eq!(
            again.session.ledger(AgentRole::Primary).tail_hash(),
            crate::ledger::GENESIS_HASH
        );
    }

    #[test]
    fn test_reload_checks_entries_appended_after_breach() {
        let s = session_in_refinement();
        let mut value: serde_json::Value = serde_json::from_slice(&s.snapshot().unwrap()).unwrap();
        value["primary_ledger"][1]["content"] = serde_json::json!("edited review");
        let bytes = serde_json::to_vec(&value).unwrap();
        let mut session = ReviewSession::restore(&bytes, SessionParams::default())
            .unwrap()
            .session;
        assert_eq!(session.integrity_breach().unwrap().link.index, 1);

        let later = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();
        session
            .advance(
                ReviewAction::Refine {
                    directive: "Tighten Approach.".into(),
                },
                "## Approach\n- Strength: c\n- Weakness: d\n",
                later,
            )
            .unwrap();
        let saved = session.snapshot().unwrap();

        // Untouched since the rebase: reloads clean.
        let clean = ReviewSession::restore(&saved, SessionParams::default()).unwrap();
        assert!(clean.breach.is_none());

        let mut value: serde_json::Value = serde_json::from_slice(&saved).unwrap();
        value["primary_ledger"][3]["content"] = serde_json::json!("softer review");
        let bytes = serde_json::to_vec(&value).unwrap();
        let restored = ReviewSession::restore(&bytes, SessionParams::default()).unwrap();
        let breach = restored.breach.expect("edit after the rebase should be flagged");
        assert_eq!(breach.role, AgentRole::Primary);
        assert_eq!(breach.link.index, 3);
        assert_eq!(restored.session.integrity_breaches().len(), 2);
    }
}
