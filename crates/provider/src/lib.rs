//! Image and text generation providers
//!
//! Identifies the upstream vendors the gateway talks to and models the error
//! shapes they return. Token rotation keys its exhaustion state by
//! `ProviderId`, and the quota classifier matches over `UpstreamError`.
//!
//! Every provider authenticates with a bearer token. Providers that allow
//! anonymous access (HuggingFace Spaces) are called without one when no token
//! is configured or every token is exhausted.

pub mod upstream;

pub use upstream::UpstreamError;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream vendor identifier.
///
/// Serializes as the lowercase id (`"gitee"`, `"huggingface"`, ...), which is
/// also the key used in the persisted token status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Gitee,
    HuggingFace,
    ModelScope,
    DeepSeek,
}

impl ProviderId {
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Gitee,
        ProviderId::HuggingFace,
        ProviderId::ModelScope,
        ProviderId::DeepSeek,
    ];

    /// Stable identifier used in config keys, store keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Gitee => "gitee",
            ProviderId::HuggingFace => "huggingface",
            ProviderId::ModelScope => "modelscope",
            ProviderId::DeepSeek => "deepseek",
        }
    }

    /// Human-readable vendor name.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderId::Gitee => "Gitee AI",
            ProviderId::HuggingFace => "HuggingFace",
            ProviderId::ModelScope => "ModelScope",
            ProviderId::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable holding the comma-separated token list.
    pub fn tokens_env_var(&self) -> &'static str {
        match self {
            ProviderId::Gitee => "GITEE_TOKENS",
            ProviderId::HuggingFace => "HUGGINGFACE_TOKENS",
            ProviderId::ModelScope => "MODELSCOPE_TOKENS",
            ProviderId::DeepSeek => "DEEPSEEK_TOKENS",
        }
    }

    /// Whether the vendor accepts unauthenticated calls when nothing is configured.
    pub fn allows_anonymous_by_default(&self) -> bool {
        matches!(self, ProviderId::HuggingFace)
    }

    /// Build the `Authorization` header value for a token.
    ///
    /// The value is marked sensitive so it is never printed by header Debug output.
    pub fn authorization(&self, token: &str) -> Result<HeaderValue, UpstreamError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            UpstreamError::Message(format!(
                "{} token contains characters not allowed in a header",
                self.label()
            ))
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// What a failed upstream call means for the token that made it.
///
/// - QuotaExceeded marks the token exhausted and rotates to the next one
/// - Permanent is returned to the caller as-is (another token cannot help)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    QuotaExceeded,
    Permanent,
}
