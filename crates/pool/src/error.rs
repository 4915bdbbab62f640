//! Pool error types.

use thiserror::Error;

/// Errors produced by the pooling core.
///
/// `Timeout` is kept distinct from every collaborator failure so callers can
/// tell "the browser is slow" apart from "the browser said no" and suggest
/// raising the deadline for the former.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {ms}ms: {label}")]
    Timeout { label: String, ms: u64 },

    #[error("{0}")]
    NotFound(String),

    #[error("cannot specify both a tab index and a tab id")]
    ArgumentConflict,

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("no browser reachable on port {port}; start it first")]
    Unreachable { port: u16 },

    #[error("invalid tab id {0:?}: expected 32 hex characters")]
    InvalidTabId(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    pub(crate) fn timeout(label: impl Into<String>, ms: u64) -> Self {
        Self::Timeout {
            label: label.into(),
            ms,
        }
    }

    /// True when the error is a deadline expiry rather than a browser
    /// failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<chromiumoxide::error::CdpError> for PoolError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        PoolError::Cdp(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
