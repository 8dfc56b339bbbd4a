//! Error types for the completeness engine.
//!
//! Only `InvalidInput` and `Config` are meant to reach a caller or operator.
//! Provider and store failures are absorbed inside the engine (see
//! `analyze::ai_adapter` and `cache`) and only show up as reduced confidence
//! or a bypassed cache.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the engine itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Empty or otherwise unusable submission. Never cached, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration invariant violated (weights, tables, boundaries...).
    /// Raised while building the engine, never per request.
    #[error("configuration error: {0}")]
    Config(String),

    /// The shared computation for a key died before producing a value.
    #[error("computation for key {0} aborted before completion")]
    ComputationAborted(String),
}

impl EngineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Short error code used in the HTTP error envelope and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::ComputationAborted(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// Errors that can occur when calling a judgment provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Attempt exceeded the adapter deadline - retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Network/transport failure (connect, reset, body read) - retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status from the provider.
    #[error("provider returned HTTP {code}")]
    Status { code: u16 },

    /// Provider refused or rejected the request - permanent.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Response could not be parsed or carried out-of-range values - permanent.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Provider switched off or not configured.
    #[error("provider disabled")]
    Disabled,
}

impl ProviderError {
    /// Whether one more attempt may succeed (network/timeout class only).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { code } => *code == 429 || *code >= 500,
            Self::Rejected(_) | Self::Malformed(_) | Self::Disabled => false,
        }
    }

    /// Short code for logs/metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::Rejected(_) => "rejected",
            Self::Malformed(_) => "malformed",
            Self::Disabled => "disabled",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                code: status.as_u16(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Errors raised by a result store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_millis(10)).is_transient());
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(ProviderError::Status { code: 503 }.is_transient());
        assert!(ProviderError::Status { code: 429 }.is_transient());
        assert!(!ProviderError::Status { code: 400 }.is_transient());
        assert!(!ProviderError::Malformed("x".into()).is_transient());
        assert!(!ProviderError::Rejected("policy".into()).is_transient());
        assert!(!ProviderError::Disabled.is_transient());
    }

    #[test]
    fn provider_error_labels() {
        assert_eq!(ProviderError::Timeout(Duration::from_millis(10)).code(), "timeout");
        assert_eq!(ProviderError::Status { code: 502 }.code(), "status");
        assert_eq!(ProviderError::Malformed("x".into()).code(), "malformed");
    }

    #[test]
    fn engine_error_codes() {
        assert_eq!(EngineError::invalid_input("x").code(), "VALIDATION_ERROR");
        assert_eq!(EngineError::config("x").code(), "CONFIGURATION_ERROR");
    }
}
