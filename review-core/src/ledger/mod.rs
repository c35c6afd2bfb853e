//! Hash-chained conversation ledger.
//!
//! One ledger per agent role. Entries are only ever appended; each entry
//! commits to its predecessor through `prev_hash`, so any insertion,
//! deletion, reordering or edit of stored history breaks at least one link.
//!
//! ```text
//! GENESIS ← e0.prev_hash   e0.hash ← e1.prev_hash   e1.hash ← e2.prev_hash ...
//! ```
//!
//! Verification is a pure function of the stored entries and the genesis
//! constant, so an exported ledger can be audited independently.

pub mod encoding;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use encoding::canonical_time;

/// `prev_hash` of the first entry in every ledger.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Who authored a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    /// Prompt sent to the agent (template-derived or caller-supplied).
    User,
    /// Response received from the agent.
    Agent,
}

impl EntryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for EntryRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded message.
///
/// Serialises to the audit shape
/// `{index, role, content, timestamp, prev_hash, hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub index: u64,
    pub role: EntryRole,
    pub content: String,
    #[serde(with = "canonical_time")]
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl LedgerEntry {
    /// Hash recomputed from the entry's own fields.
    pub fn recompute_hash(&self) -> String {
        encoding::entry_hash(
            self.index,
            self.role,
            &self.content,
            &self.timestamp,
            &self.prev_hash,
        )
    }
}

/// One message of the history handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: EntryRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::User,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::Agent,
            content: content.into(),
        }
    }
}

/// Why a link in the chain failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored `index` does not match the entry's position.
    IndexMismatch,
    /// `prev_hash` does not match the predecessor's hash (or genesis).
    PrevHashMismatch,
    /// Recomputed hash disagrees with the stored hash.
    HashMismatch,
}

impl std::fmt::Display for BreakKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexMismatch => write!(f, "index_mismatch"),
            Self::PrevHashMismatch => write!(f, "prev_hash_mismatch"),
            Self::HashMismatch => write!(f, "hash_mismatch"),
        }
    }
}

/// First broken link found by [`Ledger::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("ledger chain broken at index {index} ({kind})")]
pub struct BrokenLink {
    pub index: u64,
    pub kind: BreakKind,
}

/// Append-only, hash-chained record of one role's conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    /// Hash new entries chain from. Normally the last entry's hash; after
    /// [`Ledger::rebase_before`] it is the last verified entry's hash.
    tail: String,
    persisted_len: usize,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            tail: GENESIS_HASH.to_string(),
            persisted_len: 0,
        }
    }

    /// Rebuild a ledger from stored entries without re-hashing them.
    ///
    /// Entries are taken as-is; call [`Ledger::verify`] to audit them.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let tail = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        Self {
            entries,
            tail,
            persisted_len: 0,
        }
    }

    /// Append a message and return the recorded entry.
    ///
    /// A timestamp earlier than the current tail's is clamped to the tail's
    /// timestamp so capture times never go backwards within a ledger.
    pub fn append(
        &mut self,
        role: EntryRole,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> LedgerEntry {
        let content = content.into();
        let timestamp = match self.entries.last() {
            Some(last) if timestamp < last.timestamp => last.timestamp,
            _ => timestamp,
        };
        let index = self.entries.len() as u64;
        let prev_hash = self.tail.clone();
        let hash = encoding::entry_hash(index, role, &content, &timestamp, &prev_hash);

        let entry = LedgerEntry {
            index,
            role,
            content,
            timestamp,
            prev_hash,
            hash,
        };
        tracing::trace!(index, role = %role, hash = %entry.hash, "ledger append");
        self.tail = entry.hash.clone();
        self.entries.push(entry.clone());
        entry
    }

    /// Verify the whole chain, returning the first broken link.
    pub fn verify(&self) -> Result<(), BrokenLink> {
        self.verify_segment(0, self.entries.len(), GENESIS_HASH)
    }

    /// Verify entries `start..end`, where the entry at `start` must chain
    /// from `expected_prev`. Bounds past the end are clamped.
    pub fn verify_segment(
        &self,
        start: usize,
        end: usize,
        expected_prev: &str,
    ) -> Result<(), BrokenLink> {
        let end = end.min(self.entries.len());
        let mut expected_prev = expected_prev;
        for position in start..end {
            let entry = &self.entries[position];
            let index = position as u64;
            if entry.index != index {
                return Err(BrokenLink {
                    index,
                    kind: BreakKind::IndexMismatch,
                });
            }
            if entry.prev_hash != expected_prev {
                return Err(BrokenLink {
                    index,
                    kind: BreakKind::PrevHashMismatch,
                });
            }
            if entry.recompute_hash() != entry.hash {
                return Err(BrokenLink {
                    index,
                    kind: BreakKind::HashMismatch,
                });
            }
            expected_prev = &entry.hash;
        }
        Ok(())
    }

    /// Hash the next appended entry will chain from.
    pub fn tail_hash(&self) -> &str {
        &self.tail
    }

    /// Hash of the entry just before `index`, or genesis at 0.
    pub fn hash_before(&self, index: u64) -> String {
        (index as usize)
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }

    /// Chain future appends from the entry just before `index`.
    ///
    /// Used after a breach at `index`: stored history stays untouched, but
    /// new entries link to the last verified entry (or genesis).
    pub fn rebase_before(&mut self, index: u64) {
        let anchor = self.hash_before(index);
        self.rebase_to(anchor);
    }

    /// Chain future appends from `anchor`.
    pub fn rebase_to(&mut self, anchor: impl Into<String>) {
        let anchor = anchor.into();
        tracing::warn!(
            len = self.entries.len(),
            anchor = %anchor,
            "ledger rebased after integrity breach"
        );
        self.tail = anchor;
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    pub fn get(&self, index: usize) -> Option<&LedgerEntry> {
        self.entries.get(index)
    }

    /// Content of the most recent agent response, if any.
    pub fn latest_agent_content(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.role == EntryRole::Agent)
            .map(|e| e.content.as_str())
    }

    /// The conversation as role/content pairs, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|e| ChatMessage {
                role: e.role,
                content: e.content.clone(),
            })
            .collect()
    }

    /// Record that every current entry has reached durable storage.
    pub fn mark_persisted(&mut self) {
        self.persisted_len = self.entries.len();
    }

    /// Entries appended since the last successful save.
    pub fn unpersisted(&self) -> &[LedgerEntry] {
        &self.entries[self.persisted_len.min(self.entries.len())..]
    }

    /// One JSON object per line, in the audit encoding.
    pub fn to_audit_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Mutable access to stored entries, for tamper simulations in tests.
    #[cfg(test)]
    pub fn entries_mut_for_test(&mut self) -> &mut Vec<LedgerEntry> {
        &mut self.entries
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

// A ledger persists as its plain entry list; the tail is derived on load.
impl Serialize for Ledger {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Ledger {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let entries = Vec::<LedgerEntry>::deserialize(d)?;
        Ok(Self::from_entries(entries))
    }
}
