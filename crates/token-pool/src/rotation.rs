//! Retry-with-rotation around a single-token upstream call
//!
//! Wraps an operation that takes one token (or none, for anonymous access)
//! and retries it with the next available token whenever the failure is a
//! quota or rate-limit error. Attempts run strictly one after another.

use std::future::Future;

use provider::{ErrorClassification, ProviderId, UpstreamError};
use tracing::{debug, info, warn};

use crate::error::RotationError;
use crate::quota::classify;
use crate::tracker::TokenTracker;

/// Upper bound on token attempts for one call.
pub const MAX_ROTATION_ATTEMPTS: usize = 10;

/// Successful result together with the token that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotated<T> {
    pub value: T,
    /// `None` when the call was made anonymously.
    pub token: Option<String>,
}

impl<T> Rotated<T> {
    pub fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }
}

/// Run `operation` with the first available token, rotating on quota errors.
///
/// - Empty `tokens`: one anonymous call if `allow_anonymous`, else `NoTokensConfigured`.
/// - Quota error: the token is marked exhausted and the next one is tried.
/// - Any other error: returned immediately as `Upstream`.
/// - Every token exhausted: one anonymous call if `allow_anonymous`, else
///   `AllTokensExhausted`.
/// - `MAX_ROTATION_ATTEMPTS` spent without a result: `MaxAttemptsReached`.
pub async fn run_with_token_rotation<T, F, Fut>(
    tracker: &TokenTracker,
    provider: ProviderId,
    tokens: &[String],
    allow_anonymous: bool,
    mut operation: F,
) -> Result<Rotated<T>, RotationError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    if tokens.is_empty() {
        if !allow_anonymous {
            return Err(RotationError::NoTokensConfigured { provider });
        }
        debug!(provider = provider.as_str(), "no tokens configured, calling anonymously");
        return anonymous_call(provider, &mut operation, false).await;
    }

    for attempt in 1..=MAX_ROTATION_ATTEMPTS {
        let Some(token) = tracker.next_available(provider, tokens).await else {
            if !allow_anonymous {
                warn!(
                    provider = provider.as_str(),
                    total = tokens.len(),
                    "all tokens exhausted"
                );
                return Err(RotationError::AllTokensExhausted {
                    provider,
                    total: tokens.len(),
                });
            }
            info!(
                provider = provider.as_str(),
                "all tokens exhausted, falling back to anonymous access"
            );
            return anonymous_call(provider, &mut operation, true).await;
        };

        let token_index = tokens.iter().position(|t| *t == token);
        debug!(provider = provider.as_str(), attempt, ?token_index, "calling upstream");

        match operation(Some(token.clone())).await {
            Ok(value) => {
                return Ok(Rotated {
                    value,
                    token: Some(token),
                });
            }
            Err(error) => match classify(&error) {
                ErrorClassification::QuotaExceeded => {
                    info!(
                        provider = provider.as_str(),
                        attempt,
                        ?token_index,
                        error = %error,
                        "quota error, rotating to next token"
                    );
                    if let Err(e) = tracker.mark_exhausted(provider, &token).await {
                        warn!(provider = provider.as_str(), error = %e, "failed to persist token exhaustion");
                    }
                }
                ErrorClassification::Permanent => {
                    debug!(provider = provider.as_str(), error = %error, "non-quota error, not rotating");
                    return Err(RotationError::Upstream {
                        provider,
                        source: error,
                        all_exhausted: false,
                    });
                }
            },
        }
    }

    warn!(
        provider = provider.as_str(),
        attempts = MAX_ROTATION_ATTEMPTS,
        "rotation attempt budget spent"
    );
    Err(RotationError::MaxAttemptsReached {
        provider,
        attempts: MAX_ROTATION_ATTEMPTS,
    })
}

async fn anonymous_call<T, F, Fut>(
    provider: ProviderId,
    operation: &mut F,
    all_exhausted: bool,
) -> Result<Rotated<T>, RotationError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    metrics::counter!("token_anonymous_fallbacks_total", "provider" => provider.as_str())
        .increment(1);
    match operation(None).await {
        Ok(value) => Ok(Rotated { value, token: None }),
        Err(source) => Err(RotationError::Upstream {
            provider,
            source,
            all_exhausted,
        }),
    }
}
