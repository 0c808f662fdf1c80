use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::config::ConfigError;
use crate::config_env::{
    EnvLookup, optional_trimmed_env, parse_u32_env, parse_u64_env, process_env, require_env,
};
use crate::models::MessageRole;

use super::gateway::{
    ChatTurn, LlmCompletion, LlmGateway, LlmGatewayError, LlmGatewayFuture, LlmGatewayRequest,
};
use super::response::ResponseShape;

const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_BACKOFF_MS: u64 = 250;
const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (OpenAI, OpenRouter, Groq, ...).
    OpenAi,
    /// Google Gemini `generateContent`.
    Gemini,
    /// Hugging Face text-generation inference with a raw prompt.
    HuggingFace,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "openrouter" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "huggingface" | "hf" => Some(Self::HuggingFace),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::HuggingFace => "huggingface",
        }
    }

    pub const fn response_shape(self) -> ResponseShape {
        match self {
            Self::OpenAi => ResponseShape::ChatCompletions,
            Self::Gemini | Self::HuggingFace => ResponseShape::RawGeneration,
        }
    }

    const fn default_endpoint(self) -> &'static str {
        match self {
            Self::OpenAi => "https://openrouter.ai/api/v1/chat/completions",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::HuggingFace => "https://api-inference.huggingface.co/models",
        }
    }

    const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "openai/gpt-4o-mini",
            Self::Gemini => "gemini-2.0-flash",
            Self::HuggingFace => "mistralai/Mistral-7B-Instruct-v0.3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub primary_model: String,
    pub fallback_model: Option<String>,
}

impl ModelRoute {
    fn candidate_models(&self) -> Vec<&str> {
        let mut candidates = Vec::new();
        if !self.primary_model.is_empty() {
            candidates.push(self.primary_model.as_str());
        }

        if let Some(fallback_model) = self.fallback_model.as_deref()
            && !fallback_model.is_empty()
            && fallback_model != self.primary_model
        {
            candidates.push(fallback_model);
        }

        candidates
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub model_route: ModelRoute,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ProviderConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ProviderConfigError> {
        let kind = match optional_trimmed_env(lookup, "LLM_PROVIDER") {
            Some(raw) => ProviderKind::parse(&raw).ok_or_else(|| {
                ProviderConfigError::InvalidConfiguration(format!(
                    "LLM_PROVIDER must be one of openai, gemini, huggingface; got {raw}"
                ))
            })?,
            None => ProviderKind::OpenAi,
        };

        let endpoint_url = optional_trimmed_env(lookup, "LLM_ENDPOINT_URL")
            .unwrap_or_else(|| kind.default_endpoint().to_string());
        validate_endpoint(&endpoint_url)?;

        Ok(Self {
            kind,
            endpoint_url,
            api_key: require_env(lookup, "LLM_API_KEY")?,
            timeout_ms: parse_u64_env(lookup, "LLM_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?,
            max_retries: parse_u32_env(lookup, "LLM_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_base_backoff_ms: parse_u64_env(
                lookup,
                "LLM_RETRY_BASE_BACKOFF_MS",
                DEFAULT_RETRY_BASE_BACKOFF_MS,
            )?,
            model_route: ModelRoute {
                primary_model: optional_trimmed_env(lookup, "LLM_MODEL_PRIMARY")
                    .unwrap_or_else(|| kind.default_model().to_string()),
                fallback_model: optional_trimmed_env(lookup, "LLM_MODEL_FALLBACK"),
            },
        })
    }
}

fn validate_endpoint(endpoint_url: &str) -> Result<(), ProviderConfigError> {
    let parsed = Url::parse(endpoint_url).map_err(|err| {
        ProviderConfigError::InvalidConfiguration(format!("LLM_ENDPOINT_URL is invalid: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ProviderConfigError::InvalidConfiguration(
            "LLM_ENDPOINT_URL must start with http:// or https://".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error(transparent)]
    Env(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to build llm http client: {0}")]
    HttpClient(String),
}

/// HTTP client for the configured completion provider, with bounded retries
/// per model and an optional fallback model.
#[derive(Clone)]
pub struct ProviderGateway {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderGateway {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ProviderConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    async fn generate_for_model(
        &self,
        model: &str,
        request: &LlmGatewayRequest,
    ) -> Result<LlmCompletion, ModelAttemptError> {
        let mut attempt = 0_u32;

        loop {
            match self.send_once(model, request).await {
                Ok(completion) => return Ok(completion),
                Err(err) => {
                    if err.retryable && attempt < self.config.max_retries {
                        let backoff_multiplier = 2_u64.saturating_pow(attempt);
                        let backoff_ms = self
                            .config
                            .retry_base_backoff_ms
                            .saturating_mul(backoff_multiplier);
                        warn!(
                            provider = self.config.kind.as_str(),
                            model,
                            attempt = attempt + 1,
                            max_retries = self.config.max_retries,
                            backoff_ms,
                            error = %err.error,
                            "transient llm provider error, retrying"
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    return Err(ModelAttemptError {
                        error: err.error,
                        fallback_allowed: err.fallback_allowed,
                    });
                }
            }
        }
    }

    async fn send_once(
        &self,
        model: &str,
        request: &LlmGatewayRequest,
    ) -> Result<LlmCompletion, SendAttemptError> {
        let builder = match self.config.kind {
            ProviderKind::OpenAi => self
                .client
                .post(&self.config.endpoint_url)
                .bearer_auth(&self.config.api_key)
                .json(&chat_completions_body(model, request)),
            ProviderKind::Gemini => self
                .client
                .post(gemini_url(&self.config.endpoint_url, model))
                .header(GEMINI_API_KEY_HEADER, &self.config.api_key)
                .json(&gemini_body(request)),
            ProviderKind::HuggingFace => self
                .client
                .post(huggingface_url(&self.config.endpoint_url, model))
                .bearer_auth(&self.config.api_key)
                .json(&huggingface_body(request)),
        };

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                SendAttemptError::retryable(LlmGatewayError::Timeout, true)
            } else {
                SendAttemptError::retryable(
                    LlmGatewayError::ProviderFailure("request_unavailable".to_string()),
                    true,
                )
            }
        })?;

        let status = response.status();
        let header_request_id = header_request_id(response.headers());
        // A body cut off mid-stream is a transport failure, not a bad payload.
        let body = response.text().await.map_err(|err| {
            let error = if err.is_timeout() {
                LlmGatewayError::Timeout
            } else {
                LlmGatewayError::ProviderFailure(format!(
                    "status={} code=response_body_read_failed",
                    status.as_u16()
                ))
            };
            SendAttemptError::retryable(error, true)
        })?;

        if !status.is_success() {
            let provider_code = parse_provider_error_code(&body);
            let fallback_allowed =
                status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN;
            return Err(SendAttemptError {
                error: LlmGatewayError::ProviderFailure(format!(
                    "status={} code={provider_code}",
                    status.as_u16()
                )),
                retryable: is_retryable_status(status),
                fallback_allowed,
            });
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|_| {
            SendAttemptError::non_retryable(
                LlmGatewayError::InvalidProviderPayload("response_json_parse_failed".to_string()),
                true,
            )
        })?;

        let shape = self.config.kind.response_shape();
        let text = shape.extract_text(&parsed).ok_or_else(|| {
            SendAttemptError::non_retryable(
                LlmGatewayError::InvalidProviderPayload("missing_completion_text".to_string()),
                true,
            )
        })?;

        Ok(LlmCompletion {
            model: shape
                .extract_model(&parsed)
                .unwrap_or_else(|| model.to_string()),
            provider_request_id: header_request_id.or_else(|| shape.extract_request_id(&parsed)),
            text,
            usage: shape.extract_usage(&parsed),
        })
    }
}

impl LlmGateway for ProviderGateway {
    fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a> {
        Box::pin(async move {
            let candidate_models = self.config.model_route.candidate_models();

            for (index, model) in candidate_models.iter().enumerate() {
                match self.generate_for_model(model, &request).await {
                    Ok(completion) => return Ok(completion),
                    Err(model_err) => {
                        let has_more_candidates = index + 1 < candidate_models.len();
                        if has_more_candidates && model_err.fallback_allowed {
                            warn!(
                                provider = self.config.kind.as_str(),
                                model,
                                error = %model_err.error,
                                "llm model exhausted, falling back to next candidate"
                            );
                            continue;
                        }
                        return Err(model_err.error);
                    }
                }
            }

            Err(LlmGatewayError::ProviderFailure(
                "no_llm_model_candidates".to_string(),
            ))
        })
    }
}

#[derive(Debug)]
struct SendAttemptError {
    error: LlmGatewayError,
    retryable: bool,
    fallback_allowed: bool,
}

impl SendAttemptError {
    fn retryable(error: LlmGatewayError, fallback_allowed: bool) -> Self {
        Self {
            error,
            retryable: true,
            fallback_allowed,
        }
    }

    fn non_retryable(error: LlmGatewayError, fallback_allowed: bool) -> Self {
        Self {
            error,
            retryable: false,
            fallback_allowed,
        }
    }
}

#[derive(Debug)]
struct ModelAttemptError {
    error: LlmGatewayError,
    fallback_allowed: bool,
}

fn chat_completions_body(model: &str, request: &LlmGatewayRequest) -> Value {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(json!({ "role": "system", "content": request.system_prompt }));
    messages.extend(
        request
            .history
            .iter()
            .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content })),
    );
    messages.push(json!({ "role": "user", "content": request.user_message }));

    json!({
        "model": model,
        "messages": messages,
        "temperature": request.options.temperature,
        "max_tokens": request.options.max_tokens,
    })
}

fn gemini_body(request: &LlmGatewayRequest) -> Value {
    let mut contents = request
        .history
        .iter()
        .map(|turn| {
            json!({
                "role": gemini_role(turn.role),
                "parts": [{ "text": turn.content }],
            })
        })
        .collect::<Vec<_>>();
    contents.push(json!({
        "role": "user",
        "parts": [{ "text": request.user_message }],
    }));

    json!({
        "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
        "contents": contents,
        "generationConfig": {
            "temperature": request.options.temperature,
            "maxOutputTokens": request.options.max_tokens,
        },
    })
}

fn gemini_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "model",
    }
}

fn huggingface_body(request: &LlmGatewayRequest) -> Value {
    json!({
        "inputs": raw_prompt(&request.system_prompt, &request.history, &request.user_message),
        "parameters": {
            "temperature": request.options.temperature,
            "max_new_tokens": request.options.max_tokens,
            "return_full_text": false,
        },
    })
}

/// Flattens a conversation into a single prompt for raw-generation models.
fn raw_prompt(system_prompt: &str, history: &[ChatTurn], user_message: &str) -> String {
    let mut prompt = String::with_capacity(
        system_prompt.len()
            + user_message.len()
            + history.iter().map(|turn| turn.content.len() + 12).sum::<usize>()
            + 32,
    );
    prompt.push_str(system_prompt.trim());
    prompt.push_str("\n\n");
    for turn in history {
        let speaker = match turn.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(turn.content.trim());
        prompt.push('\n');
    }
    prompt.push_str("User: ");
    prompt.push_str(user_message.trim());
    prompt.push_str("\nAssistant:");
    prompt
}

fn gemini_url(endpoint_url: &str, model: &str) -> String {
    format!(
        "{}/models/{model}:generateContent",
        endpoint_url.trim_end_matches('/')
    )
}

fn huggingface_url(endpoint_url: &str, model: &str) -> String {
    format!("{}/{model}", endpoint_url.trim_end_matches('/'))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn header_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    // OpenAI-style errors carry `code`; Gemini uses `status` and a numeric `code`.
    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        code: Option<Value>,
        status: Option<String>,
    }

    let details = serde_json::from_str::<ProviderErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error);
    let Some(details) = details else {
        return "unknown".to_string();
    };

    if let Some(status) = details.status {
        return status;
    }

    match details.code {
        Some(Value::String(code)) => code,
        Some(Value::Number(code)) => code.to_string(),
        _ => "unknown".to_string(),
    }
}
