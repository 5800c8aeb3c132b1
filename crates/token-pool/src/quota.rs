//! Quota and rate-limit detection
//!
//! Decides whether a failed call should exhaust the token that made it. The
//! check is deliberately inclusive: a false positive costs one token for the
//! rest of the day, a false negative fails the user's request outright.

use provider::{ErrorClassification, UpstreamError};

/// Error codes that providers use for rate limiting or quota exhaustion.
const QUOTA_CODES: &[&str] = &["RATE_LIMITED", "QUOTA_EXCEEDED"];

/// Substrings (matched lowercase) that mark a message as quota-related.
const QUOTA_PATTERNS: &[&str] = &["429", "rate limit", "quota", "too many requests"];

/// Whether `error` means the token ran out of quota or was rate limited.
///
/// True for HTTP 429, a quota code, or a message containing one of the quota
/// phrases. `None` is never a quota error.
pub fn is_quota_error(error: Option<&UpstreamError>) -> bool {
    let Some(error) = error else {
        return false;
    };
    match error {
        UpstreamError::Http {
            status,
            code,
            message,
        } => {
            *status == 429
                || code.as_deref().is_some_and(is_quota_code)
                || message.as_deref().is_some_and(is_quota_message)
        }
        UpstreamError::Coded { code, message } => {
            is_quota_code(code) || message.as_deref().is_some_and(is_quota_message)
        }
        UpstreamError::Message(message) => is_quota_message(message),
    }
}

/// Classify an upstream failure for the rotation loop.
pub fn classify(error: &UpstreamError) -> ErrorClassification {
    if is_quota_error(Some(error)) {
        ErrorClassification::QuotaExceeded
    } else {
        ErrorClassification::Permanent
    }
}

fn is_quota_code(code: &str) -> bool {
    QUOTA_CODES.contains(&code)
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}
