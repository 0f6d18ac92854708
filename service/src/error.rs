//! Error taxonomy for the service.
//!
//! Each module returns typed results and the caller decides: ingest converts
//! everything into counters plus a log line, REST maps through the error
//! envelope, the channel replies with `error` frames. Invariant violations
//! panic inside their worker task and are contained by the registry watcher.

use std::time::Duration;
use thiserror::Error;

/// Error type for service operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input at a boundary. Surfaced to the caller, never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Resource absent upstream or locally. May be cached short-term.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its deadline. Retried with backoff up to budget.
    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    /// Upstream told us to slow down.
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    /// Network or connection failure. Retried.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Backing store not available. Callers fall through, never fail on this.
    #[error("cache unavailable")]
    CacheUnavailable,
    #[error(transparent)]
    Killmail(#[from] KillmailError),
}

/// Ingest-specific outcomes. `TooOld` is expected traffic, not a fault.
#[derive(Error, Debug)]
pub enum KillmailError {
    #[error("invalid killmail format: {0}")]
    InvalidFormat(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("killmail older than cutoff")]
    TooOld,
    #[error("enrichment failed: {0}")]
    EnrichmentFailed(String),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable identifier used as `error.type` in the REST envelope and as
    /// `code` in channel error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Timeout { .. } => "timeout",
            Error::RateLimited { .. } => "rate_limited",
            Error::Transport(_) => "transport_error",
            Error::CacheUnavailable => "cache_unavailable",
            Error::Killmail(inner) => inner.kind(),
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::RateLimited { .. } | Error::Transport(_)
        )
    }
}

impl KillmailError {
    pub fn kind(&self) -> &'static str {
        match self {
            KillmailError::InvalidFormat(_) => "invalid_format",
            KillmailError::MissingField(_) => "missing_required_fields",
            KillmailError::TooOld => "kill_too_old",
            KillmailError::EnrichmentFailed(_) => "enrichment_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation_error");
        assert_eq!(
            Error::Killmail(KillmailError::TooOld).kind(),
            "kill_too_old"
        );
        assert_eq!(
            Error::Killmail(KillmailError::MissingField("victim")).kind(),
            "missing_required_fields"
        );
    }

    #[test]
    fn retryability() {
        assert!(Error::Timeout {
            elapsed: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
        assert!(!Error::Validation("no".into()).is_retryable());
        assert!(!Error::Killmail(KillmailError::TooOld).is_retryable());
    }
}
