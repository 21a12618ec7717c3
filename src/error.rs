// src/error.rs
//! Error taxonomy shared by the ledger, adapters, orchestrator and cache.
//!
//! Quota denial is not an error here: it is a normal outcome
//! of admission (`quota::DenyReason`) that makes the orchestrator fall back
//! to the next provider.

use serde::Serialize;
use thiserror::Error;

use crate::quota::DenyReason;

/// Failure of a single provider call, after retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Timeouts, connection problems, 5xx and 429. Retried locally.
    #[error("transient provider failure ({provider}): {message}")]
    Transient { provider: String, message: String },

    /// Bad key, malformed request, unparsable body. Degrades the provider.
    #[error("permanent provider failure ({provider}): {message}")]
    Permanent { provider: String, message: String },

    /// Rejected locally by the ledger before any network I/O.
    #[error("quota denied for {provider}: {reason}")]
    QuotaDenied { provider: String, reason: DenyReason },

    /// Skipped because a previous permanent failure is still cooling down.
    #[error("provider {provider} degraded for another {remaining_secs}s")]
    Degraded { provider: String, remaining_secs: u64 },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent { .. })
    }
}

/// Outcome of an aggregation run that yielded no usable provider response.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum AggregateError {
    /// Every eligible provider was denied, skipped or failed.
    #[error("all providers exhausted ({attempted} attempted)")]
    Exhausted {
        attempted: usize,
        reasons: Vec<String>,
    },
}

/// Key-value cache collaborator failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KvError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by `AdaptiveCache::get_or_compute`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error(transparent)]
    Compute(#[from] AggregateError),

    #[error("timed out after {0}s waiting for in-flight compute")]
    WaitTimeout(u64),

    #[error("in-flight compute aborted before producing a result")]
    ComputeAborted,
}

/// Durable article store failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("article store unavailable: {0}")]
    Unavailable(String),
}

/// Quota counter persistence failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("counter store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("counter store decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let t = ProviderError::Transient {
            provider: "a".into(),
            message: "timeout".into(),
        };
        let p = ProviderError::Permanent {
            provider: "a".into(),
            message: "401".into(),
        };
        assert!(t.is_transient() && !t.is_permanent());
        assert!(p.is_permanent() && !p.is_transient());
    }

    #[test]
    fn exhausted_message_mentions_attempts() {
        let e = AggregateError::Exhausted {
            attempted: 3,
            reasons: vec![],
        };
        assert_eq!(e.to_string(), "all providers exhausted (3 attempted)");
    }
}
