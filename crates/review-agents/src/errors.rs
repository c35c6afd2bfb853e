//! Review error taxonomy with retry classification.
//!
//! Callers can query `is_retriable()` / `retry_category()` without string
//! matching.
//!
//! | Category    | Retriable | Meaning |
//! |-------------|-----------|---------|
//! | Transient   | yes       | agent timeout or provider failure |
//! | RateLimit   | yes       | retry with back-off |
//! | Storage     | yes       | entries stay unpersisted until a later save |
//! | Remediable  | no        | caller must change course (e.g. refine again) |
//! | Integrity   | no        | ledger breach recorded; session continues |
//! | Cancelled   | no        | cancelled by the caller |
//! | Fatal       | no        | session halted or snapshot unreadable |

use std::fmt;

use thiserror::Error;

use review_core::review::{AgentRole, IntegrityBreach, SnapshotError, TransitionError};

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Classification used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transient,
    RateLimit,
    Storage,
    Remediable,
    Integrity,
    Cancelled,
    Fatal,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit | Self::Storage)
    }

    /// Suggested max retry attempts for retriable categories.
    ///
    /// Returns `None` for non-retriable categories.
    pub fn default_max_retries(self) -> Option<u32> {
        match self {
            Self::Transient => Some(3),
            Self::RateLimit => Some(5),
            Self::Storage => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Storage => write!(f, "storage"),
            Self::Remediable => write!(f, "remediable"),
            Self::Integrity => write!(f, "integrity"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Unified error type for driver operations.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// A ledger failed verification. The breach is recorded and the ledger
    /// rebased; later operations proceed.
    #[error(transparent)]
    Integrity(#[from] IntegrityBreach),

    /// The requested operation is not valid now; the session is unchanged.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{role} agent call failed: {source}")]
    Gateway {
        role: AgentRole,
        #[source]
        source: GatewayError,
    },

    /// Snapshot could not be saved or loaded.
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ReviewError {
    pub fn gateway(role: AgentRole, source: GatewayError) -> Self {
        Self::Gateway { role, source }
    }

    /// Classify this error for retry logic.
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Integrity(_) => RetryCategory::Integrity,
            Self::Transition(TransitionError::SessionHalted { .. }) => RetryCategory::Fatal,
            Self::Transition(_) => RetryCategory::Remediable,
            Self::Gateway { source, .. } => match source {
                GatewayError::Timeout { .. } | GatewayError::Provider(_) => {
                    RetryCategory::Transient
                }
                GatewayError::RateLimited(_) => RetryCategory::RateLimit,
                GatewayError::Cancelled => RetryCategory::Cancelled,
                GatewayError::Auth(_) => RetryCategory::Fatal,
            },
            Self::Storage(_) => RetryCategory::Storage,
            Self::Snapshot(_) => RetryCategory::Fatal,
        }
    }

    /// Returns `true` if the caller may retry after this error.
    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retriable() {
        let err = ReviewError::gateway(AgentRole::Critic, GatewayError::Timeout {
            after: std::time::Duration::from_secs(5),
        });
        assert!(err.is_retriable());
        assert_eq!(err.retry_category(), RetryCategory::Transient);
        assert_eq!(err.retry_category().default_max_retries(), Some(3));
        assert_eq!(err.to_string(), "critic agent call failed: agent call timed out after 5s");
    }

    #[test]
    fn auth_is_fatal() {
        let err = ReviewError::gateway(AgentRole::Primary, GatewayError::Auth("bad key".into()));
        assert!(!err.is_retriable());
        assert_eq!(err.retry_category(), RetryCategory::Fatal);
    }

    #[test]
    fn rate_limit_backs_off() {
        let err = ReviewError::gateway(AgentRole::Primary, GatewayError::RateLimited("429".into()));
        assert_eq!(err.retry_category(), RetryCategory::RateLimit);
        assert_eq!(err.retry_category().default_max_retries(), Some(5));
    }

    #[test]
    fn transition_needs_remediation() {
        let err = ReviewError::from(TransitionError::EmptyCritique);
        assert!(!err.is_retriable());
        assert_eq!(err.retry_category(), RetryCategory::Remediable);

        let err = ReviewError::from(TransitionError::SessionHalted {
            reason: "auth".into(),
        });
        assert_eq!(err.retry_category(), RetryCategory::Fatal);
    }

    #[test]
    fn storage_is_retriable() {
        let err = ReviewError::from(StoreError::Io(std::io::Error::other("disk full")));
        assert!(err.is_retriable());
    }

    #[test]
    fn snapshot_corruption_is_fatal() {
        let err = ReviewError::from(SnapshotError::Corrupt {
            reason: "eof".into(),
        });
        assert_eq!(err.retry_category(), RetryCategory::Fatal);
    }
}
