//! Canonical, injective byte encoding of ledger entry fields.
//!
//! Every field is written as a big-endian `u64` length followed by its
//! bytes, after a fixed domain tag. Two different field tuples can never
//! produce the same byte string, so field-boundary shifts such as
//! `("ab", "c")` vs `("a", "bc")` hash differently.

use chrono::{DateTime, SecondsFormat, Utc};

use super::EntryRole;

/// Domain separation tag prepended to every encoded entry.
pub const DOMAIN_TAG: &[u8] = b"fof-ledger/v1";

/// Render a timestamp the way it is hashed and persisted.
///
/// RFC 3339 with nanosecond precision and a literal `Z`, so the rendering
/// is a pure function of the instant.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Encode the hashed fields of an entry.
pub fn encode_entry(
    index: u64,
    role: EntryRole,
    content: &str,
    timestamp: &DateTime<Utc>,
    prev_hash: &str,
) -> Vec<u8> {
    let ts = canonical_timestamp(timestamp);
    let mut buf = Vec::with_capacity(128 + content.len() + prev_hash.len());
    push_field(&mut buf, DOMAIN_TAG);
    push_field(&mut buf, &index.to_be_bytes());
    push_field(&mut buf, role.as_str().as_bytes());
    push_field(&mut buf, content.as_bytes());
    push_field(&mut buf, ts.as_bytes());
    push_field(&mut buf, prev_hash.as_bytes());
    buf
}

/// BLAKE3 digest of the canonical encoding, as lowercase hex.
pub fn entry_hash(
    index: u64,
    role: EntryRole,
    content: &str,
    timestamp: &DateTime<Utc>,
    prev_hash: &str,
) -> String {
    let bytes = encode_entry(index, role, content, timestamp, prev_hash);
    blake3::hash(&bytes).to_hex().to_string()
}

/// Serde adapter that persists timestamps in canonical form.
pub mod canonical_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::canonical_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
