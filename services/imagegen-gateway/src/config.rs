//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Provider tokens are loaded from `<PROVIDER>_TOKENS` env vars or a
//! per-provider `tokens_file`, never from the TOML directly, so the config
//! file can be committed without leaking credentials.

use common::Secret;
use provider::ProviderId;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use token_pool::parse_tokens;

use crate::upstream::ProviderSettings;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub optimize: OptimizeConfig,
    #[serde(default, deserialize_with = "deserialize_providers")]
    pub providers: BTreeMap<ProviderId, ProviderConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener for token stats and resets. Disabled when absent.
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Token status persistence
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding today's exhaustion flags. In-memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Prompt optimization settings
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizeConfig {
    #[serde(default = "default_optimize_provider")]
    pub default_provider: ProviderId,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            default_provider: default_optimize_provider(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Per-provider endpoints and token source
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    /// Raw comma-separated token list, resolved from env or `tokens_file`.
    #[serde(skip)]
    pub tokens: Option<Secret<String>>,
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    /// Call without a token when none is configured or all are exhausted.
    /// Defaults to what the provider permits.
    #[serde(default)]
    pub allow_anonymous: Option<bool>,
    #[serde(default)]
    pub generate_url: Option<String>,
    #[serde(default)]
    pub upscale_url: Option<String>,
    #[serde(default)]
    pub optimize_url: Option<String>,
    /// Default image model for generation requests
    #[serde(default)]
    pub image_model: Option<String>,
    /// Chat model used for prompt optimization
    #[serde(default)]
    pub text_model: Option<String>,
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    64
}

fn default_optimize_provider() -> ProviderId {
    ProviderId::DeepSeek
}

fn default_system_prompt() -> String {
    "Rewrite the user's image prompt into a detailed, vivid English prompt for a \
     text-to-image model. Reply with the prompt only."
        .to_string()
}

/// Provider tables are keyed by id (`[providers.huggingface]`); unknown ids
/// are rejected with the offending key in the message.
fn deserialize_providers<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<ProviderId, ProviderConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, ProviderConfig>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            key.parse::<ProviderId>()
                .map(|id| (id, value))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then resolve provider tokens.
    ///
    /// Token resolution order per provider:
    /// 1. `<PROVIDER>_TOKENS` env var (e.g. `HUGGINGFACE_TOKENS`)
    /// 2. `tokens_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for (id, provider) in config.providers.iter_mut() {
            for (field, url) in [
                ("generate_url", &provider.generate_url),
                ("upscale_url", &provider.upscale_url),
                ("optimize_url", &provider.optimize_url),
            ] {
                let Some(url) = url else { continue };
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(common::Error::Config(format!(
                        "providers.{id}.{field} must start with http:// or https://, got: {url}"
                    )));
                }
            }

            provider.tokens = resolve_tokens(*id, provider.tokens_file.as_deref())?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("imagegen-gateway.toml")
    }

    /// Runtime view of every configured provider, with parsed token lists.
    pub fn provider_settings(&self) -> BTreeMap<ProviderId, ProviderSettings> {
        self.providers
            .iter()
            .map(|(id, provider)| {
                let settings = ProviderSettings {
                    tokens: parse_tokens(provider.tokens.as_ref().map(|s| s.expose().as_str())),
                    allow_anonymous: provider
                        .allow_anonymous
                        .unwrap_or_else(|| id.allows_anonymous_by_default()),
                    generate_url: provider.generate_url.clone(),
                    upscale_url: provider.upscale_url.clone(),
                    optimize_url: provider.optimize_url.clone(),
                    image_model: provider.image_model.clone(),
                    text_model: provider.text_model.clone(),
                };
                (*id, settings)
            })
            .collect()
    }
}

fn resolve_tokens(id: ProviderId, tokens_file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(tokens) = std::env::var(id.tokens_env_var()) {
        let secret = Secret::new(tokens);
        return Ok((!secret.is_blank()).then_some(secret));
    }

    let Some(file) = tokens_file else {
        return Ok(None);
    };
    let tokens = std::fs::read_to_string(file).map_err(|e| common::Error::TokenSource {
        provider: id.to_string(),
        message: format!("failed to read tokens_file {}: {e}", file.display()),
    })?;
    let secret = Secret::new(tokens.trim().to_owned());
    Ok((!secret.is_blank()).then_some(secret))
}
