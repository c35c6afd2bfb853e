//! Review Agents
//!
//! Async side of the Flaws-of-Others reviewer: the agent gateway boundary,
//! session storage, configuration, and the driver that sequences a
//! [`review_core::review::ReviewSession`] through agent calls.

pub mod config;
pub mod driver;
pub mod errors;
pub mod gateway;
pub mod store;

pub use config::ReviewConfig;
pub use driver::{ProtocolSummary, ReviewDriver};
pub use errors::{RetryCategory, ReviewError};
pub use gateway::{AgentGateway, GatewayError, Script, ScriptStep, ScriptedGateway};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
