//! Full review protocol walk-through with canned agent responses
//! (no LLM calls).
//!
//! Covers: phase machine ↔ completeness policy ↔ ledgers ↔ snapshots
//! running together for one proposal.

use chrono::{DateTime, Duration, TimeZone, Utc};

use review_core::ledger::EntryRole;
use review_core::review::{
    AgentRole, CriteriaSet, Phase, PhaseKind, ReviewAction, ReviewSession, SessionParams,
    TransitionError, DEFAULT_CRITERIA,
};

fn clock(step: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap() + Duration::seconds(step)
}

/// Structured review; `missing_weakness` drops that criterion's weakness.
fn primary_review(missing_weakness: Option<&str>) -> String {
    let mut review = String::from("# Review of P1\n\n");
    for criterion in DEFAULT_CRITERIA {
        review.push_str(&format!("## {criterion}\n"));
        review.push_str(&format!("- Strength: {criterion} is well argued.\n"));
        if missing_weakness != Some(criterion) {
            review.push_str(&format!("- Weakness: {criterion} lacks detail.\n"));
        }
        review.push('\n');
    }
    review
}

const CRITIQUE: &str = "\
1. Unsupported claim: the Significance section asserts a 40% reduction in \
relapse without citing any source.";

const REFLECTION: &str = "\
Point 1: Rebutted. The 40% figure comes from the cited pilot cohort \
(Aim 1, preliminary data); the review now references it explicitly.";

#[test]
fn test_p1_end_to_end() {
    let mut session = ReviewSession::new(
        "P1: Targeted CRISPR screen for relapse markers",
        CriteriaSet::standard(),
        SessionParams::default(),
    );
    assert_eq!(session.phase(), &Phase::Init);

    // Initial review is missing the Innovation weakness.
    session
        .advance(
            ReviewAction::BeginReview,
            primary_review(Some("Innovation")),
            clock(0),
        )
        .unwrap();
    let report = session.phase().completeness().unwrap().clone();
    assert!(!report.is_complete());
    let directive = report.refinement_directive().unwrap();
    assert!(directive.contains("Add at least one weakness for Innovation."));

    // Satisfaction is refused until the gap is closed.
    session.accept_draft().unwrap();
    assert!(matches!(
        session.prepare(ReviewAction::SignalSatisfied),
        Err(TransitionError::StructurallyIncomplete { .. })
    ));

    session
        .advance(
            ReviewAction::Refine { directive },
            primary_review(None),
            clock(10),
        )
        .unwrap();
    assert!(session.phase().completeness().unwrap().is_complete());

    session
        .advance(ReviewAction::SignalSatisfied, CRITIQUE, clock(20))
        .unwrap();
    assert_eq!(session.phase(), &Phase::Vulnerability { critique_rounds: 1 });

    session
        .advance(ReviewAction::AcceptCritique, REFLECTION, clock(30))
        .unwrap();
    assert_eq!(session.phase().kind(), PhaseKind::Reflection);

    session.finalize(clock(40)).unwrap();
    assert!(session.is_finalized());

    let primary = session.ledger(AgentRole::Primary);
    let critic = session.ledger(AgentRole::Critic);
    assert_eq!(primary.len(), 6, "three prompt/response pairs");
    assert_eq!(critic.len(), 2, "one prompt/response pair");
    primary.verify().unwrap();
    critic.verify().unwrap();

    // Prompt always precedes response.
    for (i, entry) in primary.entries().iter().enumerate() {
        let expected = if i % 2 == 0 {
            EntryRole::User
        } else {
            EntryRole::Agent
        };
        assert_eq!(entry.role, expected);
    }

    // The critic saw the refined draft; the primary saw the critique.
    assert!(critic.entries()[0].content.contains("Innovation lacks detail."));
    assert!(primary.entries()[4].content.contains("40% reduction"));
    assert_eq!(session.current_draft(), Some(REFLECTION));

    let primary_tail = primary.tail_hash().to_string();

    // Finalize is idempotent down to the snapshot bytes.
    let sealed = session.snapshot().unwrap();
    session.finalize(clock(99)).unwrap();
    assert_eq!(session.snapshot().unwrap(), sealed);

    // And the sealed session reloads intact.
    let restored = ReviewSession::restore(&sealed, SessionParams::default()).unwrap();
    assert!(restored.breach.is_none());
    assert_eq!(restored.session.phase(), session.phase());
    assert_eq!(
        restored.session.ledger(AgentRole::Primary).tail_hash(),
        primary_tail.as_str()
    );
}

#[test]
fn test_out_of_order_operations_leave_phase_unchanged() {
    let mut session = ReviewSession::new("P2", CriteriaSet::standard(), SessionParams::default());
    let attempts = [
        ReviewAction::Refine {
            directive: "x".into(),
        },
        ReviewAction::SignalSatisfied,
        ReviewAction::RefineCritique {
            directive: "x".into(),
        },
        ReviewAction::AcceptCritique,
    ];
    for action in attempts {
        let name = action.name();
        let err = session.prepare(action).unwrap_err();
        assert!(
            matches!(err, TransitionError::InvalidTransition { .. }),
            "{name}: {err}"
        );
        assert_eq!(session.phase(), &Phase::Init);
    }
    assert!(session.finalize(clock(0)).is_err());
    assert!(session.accept_draft().is_err());
    assert_eq!(session.phase(), &Phase::Init);
    assert!(session.ledger(AgentRole::Primary).is_empty());
}

#[test]
fn test_two_critique_rounds_then_reflection_uses_latest() {
    let mut session = ReviewSession::new("P3", CriteriaSet::standard(), SessionParams::default());
    session
        .advance(ReviewAction::BeginReview, primary_review(None), clock(0))
        .unwrap();
    session.accept_draft().unwrap();
    session
        .advance(ReviewAction::SignalSatisfied, "vague critique", clock(1))
        .unwrap();
    session
        .advance(
            ReviewAction::RefineCritique {
                directive: "Cite the exact sentence for each flaw.".into(),
            },
            CRITIQUE,
            clock(2),
        )
        .unwrap();

    let turn = session.prepare(ReviewAction::AcceptCritique).unwrap();
    assert!(turn.prompt().contains("40% reduction"));
    assert!(!turn.prompt().contains("vague critique"));
    assert_eq!(session.refinements().critic, 1);
    assert_eq!(session.ledger(AgentRole::Critic).len(), 4);
}
