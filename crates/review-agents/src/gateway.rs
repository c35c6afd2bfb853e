//! Agent gateway: the boundary to whatever produces agent text.
//!
//! The session never talks to a model directly. It hands the driver a role
//! and a message history, and the driver asks an [`AgentGateway`] for the
//! reply. [`ScriptedGateway`] replays canned replies from a script file and
//! is what the CLI and the tests use.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use review_core::ledger::ChatMessage;
use review_core::review::AgentRole;

/// Failure reported by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("agent call timed out after {after:?}")]
    Timeout { after: Duration },

    /// Credentials rejected. Fatal to the session.
    #[error("agent authentication failed: {0}")]
    Auth(String),

    #[error("agent rate limited: {0}")]
    RateLimited(String),

    #[error("agent provider error: {0}")]
    Provider(String),

    #[error("agent call cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether the session must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Produces one agent reply for a role given its conversation so far.
///
/// `history` ends with the prompt the agent must answer.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn generate(&self, role: AgentRole, history: &[ChatMessage]) -> Result<String, GatewayError>;
}

/// Failure a script can inject in place of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    Auth,
    RateLimited,
    Provider,
}

/// One scripted step: a reply, or a failure, optionally after a delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Reply(String),
    Detailed {
        #[serde(default)]
        reply: String,
        #[serde(default)]
        fail: Option<ScriptedFailure>,
        #[serde(default)]
        delay_ms: u64,
    },
}

impl ScriptStep {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn fail(failure: ScriptedFailure) -> Self {
        Self::Detailed {
            reply: String::new(),
            fail: Some(failure),
            delay_ms: 0,
        }
    }

    pub fn delayed(text: impl Into<String>, delay: Duration) -> Self {
        Self::Detailed {
            reply: text.into(),
            fail: None,
            delay_ms: delay.as_millis() as u64,
        }
    }

    fn delay(&self) -> Duration {
        match self {
            Self::Reply(_) => Duration::ZERO,
            Self::Detailed { delay_ms, .. } => Duration::from_millis(*delay_ms),
        }
    }
}

/// Per-role reply queues, as read from a JSON or TOML script.
///
/// ```toml
/// primary = [
///   "## Overall Impact\n- Strength: ...",
///   { fail = "rate_limited" },
/// ]
/// critic = [{ reply = "1. Unsupported claim ...", delay_ms = 250 }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub primary: Vec<ScriptStep>,
    #[serde(default)]
    pub critic: Vec<ScriptStep>,
}

impl Script {
    /// Load a script, picking the format from the file extension
    /// (`.toml`, anything else is JSON).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let script = if is_toml {
            toml::from_str(&content).context("Failed to parse script TOML")?
        } else {
            serde_json::from_str(&content).context("Failed to parse script JSON")?
        };
        Ok(script)
    }
}

/// A recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub role: AgentRole,
    pub history: Vec<ChatMessage>,
}

/// Replays scripted replies in order, per role.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    queues: Mutex<HashMap<AgentRole, VecDeque<ScriptStep>>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub fn new(script: Script) -> Self {
        let mut queues = HashMap::new();
        queues.insert(AgentRole::Primary, script.primary.into_iter().collect());
        queues.insert(AgentRole::Critic, script.critic.into_iter().collect());
        Self {
            queues: Mutex::new(queues),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue another step for `role`.
    pub fn push(&self, role: AgentRole, step: ScriptStep) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(role)
            .or_default()
            .push_back(step);
    }

    /// Steps still queued for `role`.
    pub fn remaining(&self, role: AgentRole) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&role)
            .map_or(0, VecDeque::len)
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentGateway for ScriptedGateway {
    async fn generate(&self, role: AgentRole, history: &[ChatMessage]) -> Result<String, GatewayError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(GatewayCall {
                role,
                history: history.to_vec(),
            });

        // The step stays queued until its delay has elapsed, so a call
        // dropped mid-delay leaves it for the retry.
        let delay = {
            let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            match queues.get(&role).and_then(VecDeque::front) {
                Some(step) => step.delay(),
                None => return Err(GatewayError::Provider(format!("script exhausted for {role}"))),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&role)
            .and_then(VecDeque::pop_front);

        let Some(step) = step else {
            return Err(GatewayError::Provider(format!("script exhausted for {role}")));
        };

        match step {
            ScriptStep::Reply(text) => Ok(text),
            ScriptStep::Detailed { reply, fail, .. } => {
                match fail {
                    Some(ScriptedFailure::Auth) => {
                        Err(GatewayError::Auth(format!("scripted auth failure for {role}")))
                    }
                    Some(ScriptedFailure::RateLimited) => Err(GatewayError::RateLimited(format!(
                        "scripted rate limit for {role}"
                    ))),
                    Some(ScriptedFailure::Provider) => Err(GatewayError::Provider(format!(
                        "scripted provider failure for {role}"
                    ))),
                    None => Ok(reply),
                }
            }
        }
    }
}
