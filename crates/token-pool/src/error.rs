//! Error types for token tracking and rotation

use provider::{ProviderId, UpstreamError};

/// Errors from token status store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token status store error: {0}")]
    Store(String),

    #[error("token status serialization error: {0}")]
    Serialize(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal outcomes of a rotated call that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("no {provider} tokens configured")]
    NoTokensConfigured { provider: ProviderId },

    #[error(
        "all {total} {provider} tokens are exhausted for today; they reset at 00:00 UTC, or add more tokens"
    )]
    AllTokensExhausted { provider: ProviderId, total: usize },

    /// Non-quota failure, or the anonymous fallback failed.
    ///
    /// `all_exhausted` is set when the failing call was the anonymous attempt
    /// made after every configured token had been exhausted.
    #[error("{provider} request failed: {source}")]
    Upstream {
        provider: ProviderId,
        source: UpstreamError,
        all_exhausted: bool,
    },

    #[error("gave up on {provider} after {attempts} attempts")]
    MaxAttemptsReached { provider: ProviderId, attempts: usize },
}

impl RotationError {
    /// Upstream error behind this failure, if any.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            RotationError::Upstream { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            RotationError::NoTokensConfigured { provider }
            | RotationError::AllTokensExhausted { provider, .. }
            | RotationError::Upstream { provider, .. }
            | RotationError::MaxAttemptsReached { provider, .. } => *provider,
        }
    }
}
