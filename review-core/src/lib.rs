//! Review Ledger Core
//!
//! Deterministic building blocks for two-agent "Flaws of Others" reviews:
//!
//! - [`ledger`]: append-only, hash-chained record of one agent's conversation,
//!   with verification that reports the first broken link.
//! - [`review`]: the phase state machine (`Init → PrimaryReview → Refinement →
//!   Vulnerability → Reflection → Finalized`), the structural completeness
//!   policy, prompt templates, and versioned snapshots.
//!
//! Nothing here performs I/O or awaits. Agent calls and storage live in the
//! `review-agents` crate, which drives a [`review::ReviewSession`] through its
//! prepare/commit interface.

pub mod ledger;
pub mod review;

pub use ledger::{BrokenLink, ChatMessage, EntryRole, Ledger, LedgerEntry, GENESIS_HASH};
pub use review::{AgentRole, Phase, PhaseKind, ReviewAction, ReviewSession, TransitionError};
