use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::MessageRole;

pub type LlmGatewayFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LlmCompletion, LlmGatewayError>> + Send + 'a>>;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmGatewayRequest {
    pub requester_id: Option<String>,
    pub system_prompt: String,
    /// Earlier turns of the conversation, oldest first, excluding `user_message`.
    pub history: Vec<ChatTurn>,
    pub user_message: String,
    pub options: CompletionOptions,
}

impl LlmGatewayRequest {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            requester_id: None,
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            user_message: user_message.into(),
            options: CompletionOptions::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_requester_id(mut self, requester_id: impl AsRef<str>) -> Self {
        let trimmed = requester_id.as_ref().trim();
        if !trimmed.is_empty() {
            self.requester_id = Some(trimmed.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmTokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub model: String,
    pub provider_request_id: Option<String>,
    pub text: String,
    pub usage: Option<LlmTokenUsage>,
}

#[derive(Debug, Error)]
pub enum LlmGatewayError {
    #[error("llm provider request timed out")]
    Timeout,
    #[error("llm provider request failed: {0}")]
    ProviderFailure(String),
    #[error("llm provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
    #[error("llm circuit breaker open retry_after_seconds={retry_after_seconds}")]
    CircuitOpen { retry_after_seconds: u64 },
}

impl LlmGatewayError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProviderFailure(_) => "provider_failure",
            Self::InvalidProviderPayload(_) => "invalid_provider_payload",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }
}

pub trait LlmGateway: Send + Sync {
    /// Cheap pre-flight check made before a turn writes anything. Must not
    /// reserve capacity; `generate` re-checks.
    fn check_available(&self) -> Result<(), LlmGatewayError> {
        Ok(())
    }

    fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a>;
}

impl<G> LlmGateway for Arc<G>
where
    G: LlmGateway + ?Sized,
{
    fn check_available(&self) -> Result<(), LlmGatewayError> {
        (**self).check_available()
    }

    fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a> {
        (**self).generate(request)
    }
}
