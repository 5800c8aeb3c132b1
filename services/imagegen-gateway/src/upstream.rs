//! Upstream call sites: image generation, upscaling and prompt optimization
//!
//! Each call site builds its own JSON request, picks the provider whose
//! tokens it spends, and runs the call through `run_with_token_rotation`.
//! The token goes out as a bearer `Authorization` header; anonymous calls
//! send none.

use std::collections::BTreeMap;
use std::time::Duration;

use provider::{ProviderId, UpstreamError};
use serde::Deserialize;
use serde::Serialize;
use serde_json::{Value, json};
use token_pool::{Rotated, TokenTracker, run_with_token_rotation};
use tracing::{debug, instrument};

use crate::config::OptimizeConfig;
use crate::error::ApiError;

/// Every upscale is 4x.
pub const UPSCALE_FACTOR: u32 = 4;

/// Image sizes offered by the UI: 256..=2048 in steps of 64.
const MIN_DIMENSION: u32 = 256;
const MAX_DIMENSION: u32 = 2048;
const DIMENSION_STEP: u32 = 64;

/// The three operations that spend provider tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    Generate,
    Upscale,
    Optimize,
}

impl CallSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallSite::Generate => "generate",
            CallSite::Upscale => "upscale",
            CallSite::Optimize => "optimize",
        }
    }
}

/// Runtime settings for one provider.
///
/// Deliberately not `Debug`: `tokens` holds raw credentials.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub tokens: Vec<String>,
    pub allow_anonymous: bool,
    pub generate_url: Option<String>,
    pub upscale_url: Option<String>,
    pub optimize_url: Option<String>,
    pub image_model: Option<String>,
    pub text_model: Option<String>,
}

impl ProviderSettings {
    pub fn endpoint(&self, site: CallSite) -> Option<&str> {
        match site {
            CallSite::Generate => self.generate_url.as_deref(),
            CallSite::Upscale => self.upscale_url.as_deref(),
            CallSite::Optimize => self.optimize_url.as_deref(),
        }
    }

    /// Position of `token` in the configured list, for logs and responses.
    pub fn token_index(&self, token: Option<&str>) -> Option<usize> {
        let token = token?;
        self.tokens.iter().position(|t| t == token)
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub provider: ProviderId,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub steps: Option<u32>,
}

fn default_dimension() -> u32 {
    1024
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.prompt.trim().is_empty() {
            return Err(ApiError::InvalidRequest("prompt must not be empty".into()));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) || value % DIMENSION_STEP != 0 {
                return Err(ApiError::InvalidRequest(format!(
                    "{name} must be a multiple of {DIMENSION_STEP} between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn upstream_body(&self, settings: &ProviderSettings) -> Value {
        let mut body = json!({
            "prompt": self.prompt.trim(),
            "size": format!("{}x{}", self.width, self.height),
            "n": 1,
        });
        if let Some(model) = self.model.as_ref().or(settings.image_model.as_ref()) {
            body["model"] = json!(model);
        }
        let negative = self.negative_prompt.as_deref().map(str::trim);
        if let Some(negative) = negative.filter(|n| !n.is_empty()) {
            body["negative_prompt"] = json!(negative);
        }
        if let Some(seed) = self.seed {
            body["seed"] = json!(seed);
        }
        if let Some(steps) = self.steps {
            body["num_inference_steps"] = json!(steps);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
pub struct UpscaleRequest {
    #[serde(default = "default_upscale_provider")]
    pub provider: ProviderId,
    /// Image URL or data URI
    pub image: String,
}

fn default_upscale_provider() -> ProviderId {
    ProviderId::HuggingFace
}

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    #[serde(default)]
    pub provider: Option<ProviderId>,
    pub prompt: String,
}

/// Result of a call site, with how it was authenticated.
#[derive(Debug, Serialize)]
pub struct Completed<T> {
    pub provider: ProviderId,
    pub anonymous: bool,
    /// Index of the token in the configured list; absent for anonymous calls.
    pub token_index: Option<usize>,
    pub result: T,
}

/// Shared upstream client, provider settings and token tracker.
pub struct Gateway {
    client: reqwest::Client,
    tracker: TokenTracker,
    providers: BTreeMap<ProviderId, ProviderSettings>,
    timeout: Duration,
    optimize: OptimizeConfig,
}

impl Gateway {
    pub fn new(
        client: reqwest::Client,
        tracker: TokenTracker,
        providers: BTreeMap<ProviderId, ProviderSettings>,
        timeout: Duration,
        optimize: OptimizeConfig,
    ) -> Self {
        Self {
            client,
            tracker,
            providers,
            timeout,
            optimize,
        }
    }

    pub fn tracker(&self) -> &TokenTracker {
        &self.tracker
    }

    pub fn providers(&self) -> &BTreeMap<ProviderId, ProviderSettings> {
        &self.providers
    }

    /// Text-to-image generation via an OpenAI-compatible images endpoint.
    #[instrument(skip_all, fields(provider = %request.provider))]
    pub async fn generate(&self, request: &GenerateRequest) -> Result<Completed<Value>, ApiError> {
        request.validate()?;
        let provider = request.provider;
        let (settings, url) = self.route(provider, CallSite::Generate)?;
        let body = &request.upstream_body(settings);

        let rotated = run_with_token_rotation(
            &self.tracker,
            provider,
            &settings.tokens,
            settings.allow_anonymous,
            move |token| self.post_json(provider, url, token, body),
        )
        .await?;
        Ok(completed(provider, settings, rotated))
    }

    /// 4x upscale of an existing image.
    #[instrument(skip_all, fields(provider = %request.provider))]
    pub async fn upscale(&self, request: &UpscaleRequest) -> Result<Completed<Value>, ApiError> {
        if request.image.trim().is_empty() {
            return Err(ApiError::InvalidRequest("image must not be empty".into()));
        }
        let provider = request.provider;
        let (settings, url) = self.route(provider, CallSite::Upscale)?;
        let body = &json!({
            "image": request.image.trim(),
            "scale": UPSCALE_FACTOR,
        });

        let rotated = run_with_token_rotation(
            &self.tracker,
            provider,
            &settings.tokens,
            settings.allow_anonymous,
            move |token| self.post_json(provider, url, token, body),
        )
        .await?;
        Ok(completed(provider, settings, rotated))
    }

    /// Rewrite a prompt through a chat-completions endpoint.
    #[instrument(skip_all)]
    pub async fn optimize(&self, request: &OptimizeRequest) -> Result<Completed<String>, ApiError> {
        if request.prompt.trim().is_empty() {
            return Err(ApiError::InvalidRequest("prompt must not be empty".into()));
        }
        let provider = request.provider.unwrap_or(self.optimize.default_provider);
        let (settings, url) = self.route(provider, CallSite::Optimize)?;
        let mut body = json!({
            "messages": [
                {"role": "system", "content": self.optimize.system_prompt},
                {"role": "user", "content": request.prompt.trim()},
            ],
            "stream": false,
        });
        if let Some(model) = &settings.text_model {
            body["model"] = json!(model);
        }
        let body = &body;

        let rotated = run_with_token_rotation(
            &self.tracker,
            provider,
            &settings.tokens,
            settings.allow_anonymous,
            move |token| async move {
                let response = self.post_json(provider, url, token, body).await?;
                extract_completion(&response)
            },
        )
        .await?;
        Ok(completed(provider, settings, rotated))
    }

    fn route(
        &self,
        provider: ProviderId,
        site: CallSite,
    ) -> Result<(&ProviderSettings, &str), ApiError> {
        let unsupported = || ApiError::Unsupported { provider, site };
        let settings = self.providers.get(&provider).ok_or_else(unsupported)?;
        let url = settings.endpoint(site).ok_or_else(unsupported)?;
        Ok((settings, url))
    }

    /// POST `body` as JSON and return the parsed JSON response.
    ///
    /// Non-2xx responses, and 2xx bodies that report an error, become
    /// `UpstreamError`s for the quota classifier.
    async fn post_json(
        &self,
        provider: ProviderId,
        url: &str,
        token: Option<String>,
        body: &Value,
    ) -> Result<Value, UpstreamError> {
        let mut request = self.client.post(url).timeout(self.timeout).json(body);
        if let Some(token) = token.as_deref() {
            request = request.header(reqwest::header::AUTHORIZATION, provider.authorization(token)?);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            debug!(status = status.as_u16(), "upstream returned error status");
            return Err(UpstreamError::from_response(status.as_u16(), &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Message(format!("upstream returned invalid JSON: {e}")))?;
        if let Some(error) = UpstreamError::from_success_body(&value) {
            return Err(error);
        }
        Ok(value)
    }
}

fn completed<T>(provider: ProviderId, settings: &ProviderSettings, rotated: Rotated<T>) -> Completed<T> {
    Completed {
        provider,
        anonymous: rotated.is_anonymous(),
        token_index: settings.token_index(rotated.token.as_deref()),
        result: rotated.value,
    }
}

/// Pull `choices[0].message.content` out of a chat completion.
fn extract_completion(response: &Value) -> Result<String, UpstreamError> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            UpstreamError::Message("chat completion has no choices[0].message.content".into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use std::sync::{Arc, Mutex};
    use token_pool::RotationError;

    /// Authorization headers seen by the mock upstream, in order.
    type Seen = Arc<Mutex<Vec<Option<String>>>>;

    /// Mock upstream: 429 for tokens in `limited`, 401 for "bad", 200 otherwise.
    async fn start_mock_upstream(limited: &'static [&'static str]) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        async fn handle(
            State((seen, limited)): State<(Seen, &'static [&'static str])>,
            headers: HeaderMap,
            axum::Json(body): axum::Json<Value>,
        ) -> axum::response::Response {
            let token = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_start_matches("Bearer ").to_string());
            seen.lock().unwrap().push(token.clone());

            match token.as_deref() {
                Some(t) if limited.contains(&t) => (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"message":"Rate limit exceeded"}}"#,
                )
                    .into_response(),
                Some("bad") => (
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":{"message":"Invalid API key","code":"AUTH_INVALID"}}"#,
                )
                    .into_response(),
                _ => axum::Json(json!({
                    "data": [{"url": "https://img.example/out.png"}],
                    "echo": body,
                    "choices": [{"message": {"content": "  a vivid red fox  "}}],
                }))
                .into_response(),
            }
        }

        let app = axum::Router::new()
            .route("/generate", post(handle))
            .route("/upscale", post(handle))
            .route("/chat", post(handle))
            .with_state((seen.clone(), limited));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, seen)
    }

    fn settings(url: &str, tokens: &[&str], allow_anonymous: bool) -> ProviderSettings {
        ProviderSettings {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            allow_anonymous,
            generate_url: Some(format!("{url}/generate")),
            upscale_url: Some(format!("{url}/upscale")),
            optimize_url: Some(format!("{url}/chat")),
            image_model: Some("flux-1-schnell".into()),
            text_model: Some("deepseek-chat".into()),
        }
    }

    fn gateway(providers: Vec<(ProviderId, ProviderSettings)>) -> Gateway {
        Gateway::new(
            reqwest::Client::new(),
            TokenTracker::in_memory(),
            providers.into_iter().collect(),
            Duration::from_secs(5),
            OptimizeConfig::default(),
        )
    }

    fn generate_request(provider: ProviderId) -> GenerateRequest {
        GenerateRequest {
            provider,
            prompt: "a red fox in snow".into(),
            negative_prompt: None,
            width: 1024,
            height: 768,
            model: None,
            seed: Some(42),
            steps: None,
        }
    }

    #[test]
    fn validate_rejects_empty_prompt() {
        let mut request = generate_request(ProviderId::Gitee);
        request.prompt = "   ".into();
        assert!(matches!(
            request.validate(),
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validate_rejects_off_grid_dimensions() {
        let mut request = generate_request(ProviderId::Gitee);
        request.width = 1000;
        let err = request.validate().unwrap_err().to_string();
        assert!(err.contains("width"), "got: {err}");

        request.width = 1024;
        request.height = 4096;
        assert!(request.validate().is_err());
    }

    #[test]
    fn generate_body_uses_size_and_default_model() {
        let request = generate_request(ProviderId::Gitee);
        let body = request.upstream_body(&settings("http://x", &[], false));
        assert_eq!(body["size"], "1024x768");
        assert_eq!(body["model"], "flux-1-schnell");
        assert_eq!(body["seed"], 42);
        assert!(body.get("negative_prompt").is_none());
    }

    #[test]
    fn extract_completion_trims_content() {
        let response = json!({"choices": [{"message": {"content": " better prompt \n"}}]});
        assert_eq!(extract_completion(&response).unwrap(), "better prompt");
        assert!(extract_completion(&json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn generate_rotates_past_rate_limited_token() {
        let (url, seen) = start_mock_upstream(&["t1"]).await;
        let gateway = gateway(vec![(
            ProviderId::Gitee,
            settings(&url, &["t1", "t2"], false),
        )]);

        let done = gateway
            .generate(&generate_request(ProviderId::Gitee))
            .await
            .unwrap();
        assert_eq!(done.token_index, Some(1));
        assert!(!done.anonymous);
        assert_eq!(done.result["echo"]["size"], "1024x768");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("t1".to_string()), Some("t2".to_string())]
        );
        assert!(
            gateway
                .tracker()
                .is_exhausted(ProviderId::Gitee, "t1")
                .await
        );
    }

    #[tokio::test]
    async fn generate_stops_on_invalid_key() {
        let (url, seen) = start_mock_upstream(&[]).await;
        let gateway = gateway(vec![(
            ProviderId::ModelScope,
            settings(&url, &["bad", "good"], false),
        )]);

        let err = gateway
            .generate(&generate_request(ProviderId::ModelScope))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upscale_falls_back_to_anonymous_huggingface() {
        let (url, seen) = start_mock_upstream(&["hf1"]).await;
        let gateway = gateway(vec![(
            ProviderId::HuggingFace,
            settings(&url, &["hf1"], true),
        )]);

        let done = gateway
            .upscale(&UpscaleRequest {
                provider: ProviderId::HuggingFace,
                image: "https://img.example/in.png".into(),
            })
            .await
            .unwrap();
        assert!(done.anonymous);
        assert_eq!(done.token_index, None);
        assert_eq!(done.result["echo"]["scale"], 4);
        assert_eq!(*seen.lock().unwrap(), vec![Some("hf1".to_string()), None]);
    }

    #[tokio::test]
    async fn optimize_uses_default_provider() {
        let (url, _) = start_mock_upstream(&[]).await;
        let gateway = gateway(vec![(
            ProviderId::DeepSeek,
            settings(&url, &["ds1"], false),
        )]);

        let done = gateway
            .optimize(&OptimizeRequest {
                provider: None,
                prompt: "fox".into(),
            })
            .await
            .unwrap();
        assert_eq!(done.provider, ProviderId::DeepSeek);
        assert_eq!(done.result, "a vivid red fox");
    }

    #[tokio::test]
    async fn missing_tokens_without_anonymous() {
        let (url, seen) = start_mock_upstream(&[]).await;
        let gateway = gateway(vec![(ProviderId::Gitee, settings(&url, &[], false))]);

        let err = gateway
            .generate(&generate_request(ProviderId::Gitee))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Rotation(RotationError::NoTokensConfigured { .. })
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_provider_is_unsupported() {
        let gateway = gateway(vec![]);
        let err = gateway
            .generate(&generate_request(ProviderId::Gitee))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_not_rotated() {
        let gateway = gateway(vec![(
            ProviderId::Gitee,
            settings("http://127.0.0.1:1", &["t1", "t2"], false),
        )]);

        let err = gateway
            .generate(&generate_request(ProviderId::Gitee))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(
            !gateway
                .tracker()
                .is_exhausted(ProviderId::Gitee, "t1")
                .await
        );
    }
}
