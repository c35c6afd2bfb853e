use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use review_agents::driver::is_refinement_exhausted;
use review_agents::{
    FileSessionStore, ReviewConfig, ReviewDriver, Script, ScriptedGateway, SessionStore, StoreError,
};
use review_core::review::{AgentRole, ReviewSession, PROMPT_VERSION};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flaws-of-Others two-agent review ledger", long_about = None)]
struct Args {
    /// Review config TOML (criteria, role models, limits, templates)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full protocol against scripted agent replies
    Run {
        /// Proposal text file
        #[arg(long)]
        proposal: PathBuf,
        /// Agent reply script (JSON or TOML)
        #[arg(long)]
        script: PathBuf,
        /// Session id; resumes the stored session when it exists
        #[arg(long)]
        session: Option<String>,
    },
    /// Send one message to both agents of a stored session
    Broadcast {
        #[arg(long)]
        session: String,
        /// Agent reply script (JSON or TOML)
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        message: String,
    },
    /// Verify both ledgers of a stored session
    Verify {
        #[arg(long)]
        session: String,
    },
    /// Print one role's ledger as audit JSON lines
    Export {
        #[arg(long)]
        session: String,
        #[arg(long, value_parser = parse_role)]
        role: AgentRole,
    },
    /// Show phase, ledger sizes and completeness of a stored session
    Status {
        #[arg(long)]
        session: String,
    },
}

fn parse_role(raw: &str) -> Result<AgentRole, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ReviewConfig::load(args.config.as_deref())?;
    let store = Arc::new(FileSessionStore::new(config.store_dir.clone()));

    match args.command {
        Command::Run {
            proposal,
            script,
            session,
        } => run(&config, store, &proposal, &script, session).await,
        Command::Broadcast {
            session,
            script,
            message,
        } => broadcast(&config, store, &session, &script, message).await,
        Command::Verify { session } => verify(&config, store.as_ref(), &session).await,
        Command::Export { session, role } => {
            let restored = load(&config, store.as_ref(), &session).await?;
            print!("{}", restored.ledger(role).to_audit_jsonl()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { session } => status(&config, store.as_ref(), &session).await,
    }
}

async fn load(config: &ReviewConfig, store: &dyn SessionStore, id: &str) -> Result<ReviewSession> {
    let bytes = store
        .load(id)
        .await
        .with_context(|| format!("Failed to load session {id}"))?;
    let restored = ReviewSession::restore(&bytes, config.session_params())
        .with_context(|| format!("Session {id} snapshot is unreadable"))?;
    if let Some(breach) = &restored.breach {
        warn!(%breach, "ledger integrity breach");
    }
    Ok(restored.session)
}

async fn run(
    config: &ReviewConfig,
    store: Arc<FileSessionStore>,
    proposal: &std::path::Path,
    script: &std::path::Path,
    session_id: Option<String>,
) -> Result<ExitCode> {
    let proposal_text = std::fs::read_to_string(proposal)
        .with_context(|| format!("Failed to read proposal {}", proposal.display()))?;
    let gateway = Arc::new(ScriptedGateway::new(Script::from_file(script)?));
    let timeout = config.gateway_timeout();
    let params = config.session_params();

    let existing = match &session_id {
        Some(id) => match store.load(id).await {
            Ok(_) => Some(id.clone()),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e).context("Failed to check for an existing session"),
        },
        None => None,
    };

    let driver = match existing {
        Some(id) => {
            let (driver, breach) =
                ReviewDriver::open(&id, params, gateway, store, timeout).await?;
            if let Some(breach) = breach {
                warn!(%breach, "resuming session with a recorded integrity breach");
            }
            driver
        }
        None => {
            let criteria = config.criteria_set()?;
            let session = match session_id {
                Some(id) => ReviewSession::with_id(id, proposal_text, criteria, params),
                None => ReviewSession::new(proposal_text, criteria, params),
            };
            ReviewDriver::new(session, gateway, store, timeout)
        }
    };

    info!(
        session_id = %driver.session_id().await,
        primary_model = %config.roles.primary.model,
        critic_model = %config.roles.critic.model,
        prompt_version = PROMPT_VERSION,
        "review run starting"
    );

    match driver.run_protocol().await {
        Ok(summary) => {
            println!("session:   {}", summary.session_id);
            println!("phase:     {}", summary.phase);
            println!(
                "entries:   primary {} / critic {}",
                summary.primary_entries, summary.critic_entries
            );
            println!(
                "refined:   primary {} / critic {}",
                summary.refinements.primary, summary.refinements.critic
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if is_refinement_exhausted(&e) => {
            eprintln!("review stopped: {e}");
            eprintln!("session {} saved; adjust limits and rerun to resume", driver.session_id().await);
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}

async fn broadcast(
    config: &ReviewConfig,
    store: Arc<FileSessionStore>,
    id: &str,
    script: &std::path::Path,
    message: String,
) -> Result<ExitCode> {
    let gateway = Arc::new(ScriptedGateway::new(Script::from_file(script)?));
    let (driver, breach) = ReviewDriver::open(
        id,
        config.session_params(),
        gateway,
        store,
        config.gateway_timeout(),
    )
    .await?;
    if let Some(breach) = breach {
        warn!(%breach, "broadcasting into a session with a recorded integrity breach");
    }
    for turn in driver.broadcast(message).await? {
        println!("[{}] {}", turn.role, turn.response_entry.content);
    }
    Ok(ExitCode::SUCCESS)
}

async fn verify(config: &ReviewConfig, store: &dyn SessionStore, id: &str) -> Result<ExitCode> {
    // Loading audits every segment and records any new breach.
    let session = load(config, store, id).await?;
    let mut intact = true;
    for role in AgentRole::ALL {
        let ledger = session.ledger(role);
        let mut breaches = session
            .integrity_breaches()
            .iter()
            .filter(|b| b.role == role)
            .peekable();
        if breaches.peek().is_none() {
            println!("{role}: ok ({} entries)", ledger.len());
            continue;
        }
        intact = false;
        for breach in breaches {
            println!(
                "{role}: BROKEN at index {} ({})",
                breach.link.index, breach.link.kind
            );
        }
    }
    Ok(if intact {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn status(config: &ReviewConfig, store: &dyn SessionStore, id: &str) -> Result<ExitCode> {
    let session = load(config, store, id).await?;
    println!("session:   {}", session.session_id());
    println!("phase:     {}", session.phase());
    println!("generation: {}", session.generation());
    for role in AgentRole::ALL {
        println!("{role}:   {} entries", session.ledger(role).len());
    }
    let refinements = session.refinements();
    println!(
        "refined:   primary {} / critic {}",
        refinements.primary, refinements.critic
    );
    if let Some(report) = session.draft_completeness() {
        println!("coverage:  {}", report.summary_line());
        for advisory in report.balance_advisories() {
            println!(
                "balance:   {} has {} strengths to {} weaknesses",
                advisory.criterion, advisory.strengths, advisory.weaknesses
            );
        }
    }
    if let Some(reason) = session.halted() {
        println!("halted:    {reason}");
    }
    if let Some(breach) = session.integrity_breach() {
        println!("breach:    {breach}");
    }
    Ok(ExitCode::SUCCESS)
}
