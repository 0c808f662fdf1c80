pub mod breaker;
pub mod gateway;
pub mod observability;
pub mod provider;
pub mod response;

pub use breaker::{CircuitBreakerConfig, CircuitBreakerGateway, retry_after_seconds};
pub use gateway::{
    ChatTurn, CompletionOptions, LlmCompletion, LlmGateway, LlmGatewayError, LlmGatewayFuture,
    LlmGatewayRequest, LlmTokenUsage,
};
pub use observability::{LlmTelemetryEvent, generate_with_telemetry, log_llm_telemetry};
pub use provider::{ModelRoute, ProviderConfig, ProviderConfigError, ProviderGateway, ProviderKind};
pub use response::ResponseShape;
