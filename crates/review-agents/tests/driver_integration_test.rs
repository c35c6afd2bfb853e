//! Mocked driver integration test, exercising the async review loop with
//! scripted agents (no LLM calls).
//!
//! Covers: driver ↔ session ↔ gateway ↔ store, including timeouts,
//! cancellation, auth halts, storage failures, broadcasts, and concurrent
//! callers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use review_agents::gateway::ScriptedFailure;
use review_agents::{
    FileSessionStore, GatewayError, MemorySessionStore, RetryCategory, ReviewDriver, ReviewError,
    Script, ScriptStep, ScriptedGateway, SessionStore, StoreError,
};
use review_core::review::{
    AgentRole, CriteriaSet, PhaseKind, ReviewAction, ReviewSession, SessionParams,
    TransitionError, DEFAULT_CRITERIA,
};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Structured review; `missing_weakness` drops that criterion's weakness.
fn review(missing_weakness: Option<&str>) -> String {
    let mut out = String::new();
    for c in DEFAULT_CRITERIA {
        out.push_str(&format!("## {c}\n- Strength: {c} is convincing.\n"));
        if missing_weakness != Some(c) {
            out.push_str(&format!("- Weakness: {c} needs more detail.\n"));
        }
    }
    out
}

const CRITIQUE: &str = "1. Unsupported claim: Significance cites no prior screen.";
const REFLECTION: &str = "1. Rebutted: the prior screen is reference [4] in the proposal.";

fn p1_script() -> Script {
    Script {
        primary: vec![
            ScriptStep::reply(review(Some("Innovation"))),
            ScriptStep::reply(review(None)),
            ScriptStep::reply(REFLECTION),
        ],
        critic: vec![ScriptStep::reply(CRITIQUE)],
    }
}

fn new_session(id: &str) -> ReviewSession {
    ReviewSession::with_id(
        id,
        "P1: Genome-wide screen for relapse markers",
        CriteriaSet::standard(),
        SessionParams::default(),
    )
}

fn driver_with(
    id: &str,
    gateway: Arc<ScriptedGateway>,
    store: Arc<dyn SessionStore>,
    timeout: Duration,
) -> ReviewDriver {
    ReviewDriver::new(new_session(id), gateway, store, timeout)
}

async fn ledger_lens(driver: &ReviewDriver) -> (usize, usize) {
    driver
        .inspect(|s| {
            (
                s.ledger(AgentRole::Primary).len(),
                s.ledger(AgentRole::Critic).len(),
            )
        })
        .await
}

/// Store whose saves can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemorySessionStore,
    failing: AtomicBool,
    saves: AtomicUsize,
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(id, bytes).await
    }

    async fn load(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.load(id).await
    }
}

#[tokio::test]
async fn test_p1_scenario_step_by_step() {
    let gateway = Arc::new(ScriptedGateway::new(p1_script()));
    let store = Arc::new(MemorySessionStore::new());
    let driver = driver_with("p1", gateway.clone(), store.clone(), TIMEOUT);

    driver.execute(ReviewAction::BeginReview).await.unwrap();
    let directive = driver
        .inspect(|s| {
            s.phase()
                .completeness()
                .and_then(|r| r.refinement_directive())
        })
        .await
        .expect("initial review should be incomplete");
    assert!(directive.contains("weakness for Innovation"));

    driver.accept_draft().await.unwrap();
    let err = driver
        .execute(ReviewAction::SignalSatisfied)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReviewError::Transition(TransitionError::StructurallyIncomplete { .. })
    ));

    driver
        .execute(ReviewAction::Refine { directive })
        .await
        .unwrap();
    driver.execute(ReviewAction::SignalSatisfied).await.unwrap();
    driver.execute(ReviewAction::AcceptCritique).await.unwrap();
    let sealed = driver.finalize().await.unwrap();

    assert_eq!(ledger_lens(&driver).await, (6, 2));
    assert_eq!(driver.finalize().await.unwrap(), sealed);
    assert_eq!(store.load("p1").await.unwrap(), sealed);

    // The critic saw the refined review, with history ending in the prompt.
    let calls = gateway.calls();
    let critic_call = calls.iter().find(|c| c.role == AgentRole::Critic).unwrap();
    assert_eq!(critic_call.history.len(), 1);
    assert!(critic_call.history[0]
        .content
        .contains("Innovation needs more detail."));

    let restored = ReviewSession::restore(&sealed, SessionParams::default()).unwrap();
    assert!(restored.breach.is_none());
    assert_eq!(restored.session.phase().kind(), PhaseKind::Finalized);
}

#[tokio::test]
async fn test_run_protocol_refines_until_complete() {
    let gateway = Arc::new(ScriptedGateway::new(p1_script()));
    let store = Arc::new(MemorySessionStore::new());
    let driver = driver_with("auto", gateway.clone(), store, TIMEOUT);

    let summary = driver.run_protocol().await.unwrap();
    assert_eq!(summary.phase, PhaseKind::Finalized);
    assert_eq!(summary.primary_entries, 6);
    assert_eq!(summary.critic_entries, 2);
    assert_eq!(summary.refinements.primary, 1);
    assert_eq!(gateway.remaining(AgentRole::Primary), 0);
    assert_eq!(gateway.remaining(AgentRole::Critic), 0);

    let calls = gateway.calls();
    let refine_prompt = &calls[1].history.last().unwrap().content;
    assert!(refine_prompt.contains("Add at least one weakness for Innovation."));
}

#[tokio::test]
async fn test_run_protocol_stops_at_refinement_budget() {
    let mut params = SessionParams::default();
    params.limits.max_primary = 2;
    let session = ReviewSession::with_id("budget", "P", CriteriaSet::standard(), params);
    let incomplete = ScriptStep::reply(review(Some("Approach")));
    let gateway = Arc::new(ScriptedGateway::new(Script {
        primary: vec![incomplete.clone(), incomplete.clone(), incomplete],
        critic: vec![],
    }));
    let driver = ReviewDriver::new(
        session,
        gateway,
        Arc::new(MemorySessionStore::new()),
        TIMEOUT,
    );

    let err = driver.run_protocol().await.unwrap_err();
    assert!(review_agents::driver::is_refinement_exhausted(&err));
    assert_eq!(err.retry_category(), RetryCategory::Remediable);
    assert_eq!(
        driver.inspect(|s| s.phase().kind()).await,
        PhaseKind::Refinement
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_appends_nothing() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.push(
        AgentRole::Primary,
        ScriptStep::delayed(review(None), Duration::from_secs(2)),
    );
    let store = Arc::new(MemorySessionStore::new());
    let driver = driver_with(
        "slow",
        gateway.clone(),
        store.clone(),
        Duration::from_millis(500),
    );

    let err = driver.execute(ReviewAction::BeginReview).await.unwrap_err();
    assert!(matches!(
        &err,
        ReviewError::Gateway {
            role: AgentRole::Primary,
            source: GatewayError::Timeout { after },
        } if *after == Duration::from_millis(500)
    ));
    assert_eq!(
        err.to_string(),
        "primary agent call failed: agent call timed out after 500ms"
    );
    assert!(err.is_retriable());
    assert_eq!(ledger_lens(&driver).await, (0, 0));
    assert_eq!(driver.inspect(|s| s.phase().kind()).await, PhaseKind::Init);
    // The unanswered reply is still queued for the retry.
    assert_eq!(gateway.remaining(AgentRole::Primary), 1);

    // Retrying with a longer budget gets that same reply.
    driver.save().await.unwrap();
    let (patient, _) = ReviewDriver::open(
        "slow",
        SessionParams::default(),
        gateway.clone(),
        store,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let committed = patient.execute(ReviewAction::BeginReview).await.unwrap();
    assert_eq!(committed.response_entry.content, review(None));
    assert_eq!(ledger_lens(&patient).await, (2, 0));
    assert_eq!(gateway.remaining(AgentRole::Primary), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_appends_nothing() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.push(
        AgentRole::Primary,
        ScriptStep::delayed("late", Duration::from_secs(10)),
    );
    let driver = driver_with(
        "cancel",
        gateway.clone(),
        Arc::new(MemorySessionStore::new()),
        TIMEOUT,
    );
    let token = driver.cancel_token();

    let task = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.execute(ReviewAction::BeginReview).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.retry_category(), RetryCategory::Cancelled);
    assert_eq!(ledger_lens(&driver).await, (0, 0));
    assert_eq!(gateway.remaining(AgentRole::Primary), 1);
}

#[tokio::test]
async fn test_auth_failure_halts_session() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.push(AgentRole::Primary, ScriptStep::fail(ScriptedFailure::Auth));
    gateway.push(AgentRole::Primary, ScriptStep::reply(review(None)));
    let store = Arc::new(MemorySessionStore::new());
    let driver = driver_with("auth", gateway, store.clone(), TIMEOUT);

    let err = driver.execute(ReviewAction::BeginReview).await.unwrap_err();
    assert_eq!(err.retry_category(), RetryCategory::Fatal);

    let err = driver.execute(ReviewAction::BeginReview).await.unwrap_err();
    assert!(matches!(
        err,
        ReviewError::Transition(TransitionError::SessionHalted { .. })
    ));
    assert_eq!(ledger_lens(&driver).await, (0, 0));

    // The halt survives a reload.
    let bytes = store.load("auth").await.unwrap();
    let restored = ReviewSession::restore(&bytes, SessionParams::default()).unwrap();
    assert!(restored.session.halted().is_some());
}

#[tokio::test]
async fn test_rate_limit_is_retriable_and_leaves_session_unchanged() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.push(
        AgentRole::Primary,
        ScriptStep::fail(ScriptedFailure::RateLimited),
    );
    let driver = driver_with(
        "rate",
        gateway,
        Arc::new(MemorySessionStore::new()),
        TIMEOUT,
    );
    let err = driver.execute(ReviewAction::BeginReview).await.unwrap_err();
    assert_eq!(err.retry_category(), RetryCategory::RateLimit);
    assert!(driver.inspect(|s| s.halted().is_none()).await);
    assert_eq!(ledger_lens(&driver).await, (0, 0));
}

#[tokio::test]
async fn test_storage_failure_keeps_entries_unpersisted() {
    let gateway = Arc::new(ScriptedGateway::new(p1_script()));
    let store = Arc::new(FlakyStore::default());
    store.failing.store(true, Ordering::SeqCst);
    let driver = driver_with("flaky", gateway, store.clone(), TIMEOUT);

    let err = driver.execute(ReviewAction::BeginReview).await.unwrap_err();
    assert!(matches!(err, ReviewError::Storage(_)));
    assert!(err.is_retriable());
    // Committed in memory, not yet durable.
    assert_eq!(
        driver.inspect(|s| (s.phase().kind(), s.unpersisted_len())).await,
        (PhaseKind::PrimaryReview, 2)
    );
    assert!(matches!(
        store.load("flaky").await,
        Err(StoreError::NotFound(_))
    ));

    store.failing.store(false, Ordering::SeqCst);
    driver.save().await.unwrap();
    assert_eq!(driver.inspect(|s| s.unpersisted_len()).await, 0);
    let restored =
        ReviewSession::restore(&store.load("flaky").await.unwrap(), SessionParams::default())
            .unwrap();
    assert_eq!(restored.session.phase().kind(), PhaseKind::PrimaryReview);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_operations_on_one_session_serialise() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.push(
        AgentRole::Primary,
        ScriptStep::delayed(review(None), Duration::from_secs(3)),
    );
    gateway.push(
        AgentRole::Primary,
        ScriptStep::delayed("Aim 2 is weakest.", Duration::from_secs(3)),
    );
    let driver = driver_with(
        "shared",
        gateway.clone(),
        Arc::new(MemorySessionStore::new()),
        TIMEOUT,
    );

    let first = driver.clone();
    let second = driver.clone();
    let (a, b) = tokio::join!(
        first.execute(ReviewAction::BeginReview),
        second.execute(ReviewAction::Consult {
            role: AgentRole::Primary,
            message: "Which aim is weakest?".into(),
        }),
    );
    a.unwrap();
    b.unwrap();

    // The consult was prepared only after the review pair was committed.
    let calls = gateway.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].history.len(), 1);
    assert_eq!(calls[1].history.len(), 3);

    let primary_ok = driver
        .inspect(|s| s.ledger(AgentRole::Primary).verify().is_ok())
        .await;
    assert!(primary_ok);
    assert_eq!(ledger_lens(&driver).await, (4, 0));
}

#[tokio::test(start_paused = true)]
async fn test_separate_sessions_run_in_parallel() {
    let make = |id: &str| {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push(
            AgentRole::Primary,
            ScriptStep::delayed(review(None), Duration::from_secs(10)),
        );
        driver_with(id, gateway, Arc::new(MemorySessionStore::new()), TIMEOUT)
    };
    let one = make("one");
    let two = make("two");

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(
        one.execute(ReviewAction::BeginReview),
        two.execute(ReviewAction::BeginReview),
    );
    a.unwrap();
    b.unwrap();
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn test_file_store_reload_and_tamper_detection() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path()));
    let driver = driver_with(
        "onfile",
        Arc::new(ScriptedGateway::new(p1_script())),
        store.clone(),
        TIMEOUT,
    );
    driver.run_protocol().await.unwrap();

    let (reopened, breach) = ReviewDriver::open(
        "onfile",
        SessionParams::default(),
        Arc::new(ScriptedGateway::default()),
        store.clone(),
        TIMEOUT,
    )
    .await
    .unwrap();
    assert!(breach.is_none());
    assert_eq!(
        reopened.inspect(|s| s.phase().kind()).await,
        PhaseKind::Finalized
    );

    // Edit one critic entry on disk.
    let path = store.path_for("onfile");
    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    value["critic_ledger"][1]["content"] = serde_json::json!("a softer critique");
    std::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();

    let (_, breach) = ReviewDriver::open(
        "onfile",
        SessionParams::default(),
        Arc::new(ScriptedGateway::default()),
        store,
        TIMEOUT,
    )
    .await
    .unwrap();
    let breach = breach.expect("tampering should be flagged");
    assert_eq!(breach.role, AgentRole::Critic);
    assert_eq!(breach.link.index, 1);
}

#[tokio::test]
async fn test_reset_archives_prior_generation() {
    let store = Arc::new(MemorySessionStore::new());
    let driver = driver_with(
        "again",
        Arc::new(ScriptedGateway::new(p1_script())),
        store.clone(),
        TIMEOUT,
    );
    driver.execute(ReviewAction::BeginReview).await.unwrap();
    driver.reset().await.unwrap();

    assert_eq!(ledger_lens(&driver).await, (0, 0));
    assert_eq!(driver.inspect(|s| s.generation()).await, 1);
    let archived = ReviewSession::restore(
        &store.load("again.gen0").await.unwrap(),
        SessionParams::default(),
    )
    .unwrap();
    assert_eq!(archived.session.ledger(AgentRole::Primary).len(), 2);
    assert_eq!(archived.session.phase().kind(), PhaseKind::PrimaryReview);
}

async fn at_primary_review(id: &str, gateway: Arc<ScriptedGateway>) -> ReviewDriver {
    gateway.push(AgentRole::Primary, ScriptStep::reply(review(None)));
    let driver = driver_with(id, gateway, Arc::new(MemorySessionStore::new()), TIMEOUT);
    driver.execute(ReviewAction::BeginReview).await.unwrap();
    driver
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_both_agents_concurrently() {
    let gateway = Arc::new(ScriptedGateway::default());
    let driver = at_primary_review("bcast", gateway.clone()).await;
    gateway.push(
        AgentRole::Primary,
        ScriptStep::delayed("Primary acknowledges.", Duration::from_secs(4)),
    );
    gateway.push(
        AgentRole::Critic,
        ScriptStep::delayed("Critic acknowledges.", Duration::from_secs(4)),
    );

    let started = tokio::time::Instant::now();
    let [primary, critic] = driver
        .broadcast("The applicant added a power analysis.")
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));

    assert_eq!(primary.role, AgentRole::Primary);
    assert_eq!(primary.response_entry.content, "Primary acknowledges.");
    assert_eq!(critic.role, AgentRole::Critic);
    assert_eq!(critic.prompt_entry.content, "The applicant added a power analysis.");
    assert_eq!(ledger_lens(&driver).await, (4, 2));
    assert_eq!(
        driver.inspect(|s| s.phase().kind()).await,
        PhaseKind::PrimaryReview
    );
    assert_eq!(driver.inspect(|s| s.unpersisted_len()).await, 0);
}

#[tokio::test]
async fn test_broadcast_failure_appends_to_neither_ledger() {
    let gateway = Arc::new(ScriptedGateway::default());
    let driver = at_primary_review("bcast-fail", gateway.clone()).await;
    gateway.push(AgentRole::Primary, ScriptStep::reply("Primary acknowledges."));
    gateway.push(
        AgentRole::Critic,
        ScriptStep::fail(ScriptedFailure::Provider),
    );

    let err = driver.broadcast("Budget revised.").await.unwrap_err();
    assert!(matches!(
        err,
        ReviewError::Gateway {
            role: AgentRole::Critic,
            source: GatewayError::Provider(_),
        }
    ));
    assert!(err.is_retriable());
    assert_eq!(ledger_lens(&driver).await, (2, 0));
    assert!(driver.inspect(|s| s.halted().is_none()).await);
}

#[tokio::test]
async fn test_broadcast_auth_failure_halts() {
    let gateway = Arc::new(ScriptedGateway::default());
    let driver = at_primary_review("bcast-auth", gateway.clone()).await;
    gateway.push(AgentRole::Primary, ScriptStep::fail(ScriptedFailure::Auth));
    gateway.push(AgentRole::Critic, ScriptStep::reply("Critic acknowledges."));

    let err = driver.broadcast("Budget revised.").await.unwrap_err();
    assert_eq!(err.retry_category(), RetryCategory::Fatal);
    assert_eq!(ledger_lens(&driver).await, (2, 0));

    let err = driver.broadcast("Again.").await.unwrap_err();
    assert!(matches!(
        err,
        ReviewError::Transition(TransitionError::SessionHalted { .. })
    ));
}

#[tokio::test]
async fn test_broadcast_unavailable_before_review() {
    let driver = driver_with(
        "bcast-init",
        Arc::new(ScriptedGateway::default()),
        Arc::new(MemorySessionStore::new()),
        TIMEOUT,
    );
    let err = driver.broadcast("Hello both.").await.unwrap_err();
    assert!(matches!(
        err,
        ReviewError::Transition(TransitionError::ConsultUnavailable {
            phase: PhaseKind::Init
        })
    ));
}
