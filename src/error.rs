//! Typed failures for upstream calls.
//!
//! Every adapter, the rate-limited client, and the token manager report
//! failures as a [`ScrapeError`]. The executor uses [`ScrapeError::kind`]
//! to decide between retrying a page and aborting the whole job:
//!
//! | Kind | Retried | Effect on the job |
//! |------|---------|-------------------|
//! | `Transport`, `Timeout` | yes, with backoff | page counted as an error once attempts run out |
//! | `RateLimited` | yes, `Retry-After` plus growing backoff | same as transport |
//! | `AuthFailed` | not by the executor; the adapter drops a rejected token and resends once after a fresh login | job fails, operator must fix credentials |
//! | `UpstreamSchemaChanged` | no | job fails, adapter needs updating |
//! | `Cancelled` | no | job closes as partially succeeded |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single upstream interaction.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("upstream schema changed: {0}")]
    UpstreamSchemaChanged(String),

    #[error("source '{0}' is not registered")]
    UnknownSource(String),

    #[error("cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// A required field was absent or had the wrong type.
    pub fn missing_field(field: &str, context: &str) -> Self {
        Self::UpstreamSchemaChanged(format!("missing or invalid field '{field}' in {context}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::UpstreamSchemaChanged(_) => ErrorKind::UpstreamSchemaChanged,
            Self::UnknownSource(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Transient failures that the executor retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    /// Failures that abort the whole job and need an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed(_) | Self::UpstreamSchemaChanged(_) | Self::UnknownSource(_)
        )
    }

    /// Upstream hint for how long to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Serializable error classification recorded on jobs and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Timeout,
    RateLimited,
    AuthFailed,
    UpstreamSchemaChanged,
    LinkInconsistency,
    Configuration,
    Storage,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::UpstreamSchemaChanged => "upstream_schema_changed",
            Self::LinkInconsistency => "link_inconsistency",
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "transport" => Self::Transport,
            "timeout" => Self::Timeout,
            "rate_limited" => Self::RateLimited,
            "auth_failed" => Self::AuthFailed,
            "upstream_schema_changed" => Self::UpstreamSchemaChanged,
            "link_inconsistency" => Self::LinkInconsistency,
            "configuration" => Self::Configuration,
            "storage" => Self::Storage,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Whether a job that ended with this kind needs operator attention.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed | Self::UpstreamSchemaChanged | Self::Configuration
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
