use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::gateway::{LlmCompletion, LlmGateway, LlmGatewayError, LlmGatewayRequest};

#[derive(Debug, Clone)]
pub struct LlmTelemetryEvent {
    pub personality: String,
    pub outcome: &'static str,
    pub latency_ms: u64,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub error_type: Option<&'static str>,
}

/// Runs one completion and captures latency, model and token usage for the
/// `llm_request` log line.
pub async fn generate_with_telemetry(
    llm_gateway: &dyn LlmGateway,
    personality: &str,
    request: LlmGatewayRequest,
) -> (Result<LlmCompletion, LlmGatewayError>, LlmTelemetryEvent) {
    let started_at = Instant::now();
    let result = llm_gateway.generate(request).await;
    let telemetry = telemetry_for_result(personality, started_at.elapsed(), &result);
    (result, telemetry)
}

pub fn log_llm_telemetry(session_id: &str, user_id: &str, telemetry: &LlmTelemetryEvent) {
    if telemetry.outcome == "failure" {
        warn!(
            metric_name = "llm_request",
            personality = telemetry.personality.as_str(),
            outcome = telemetry.outcome,
            session_id,
            user_id,
            latency_ms = telemetry.latency_ms,
            error_type = ?telemetry.error_type,
            "llm request metrics"
        );
    } else {
        info!(
            metric_name = "llm_request",
            personality = telemetry.personality.as_str(),
            outcome = telemetry.outcome,
            session_id,
            user_id,
            model = ?telemetry.model,
            latency_ms = telemetry.latency_ms,
            prompt_tokens = ?telemetry.prompt_tokens,
            completion_tokens = ?telemetry.completion_tokens,
            total_tokens = ?telemetry.total_tokens,
            "llm request metrics"
        );
    }
}

fn telemetry_for_result(
    personality: &str,
    latency: Duration,
    result: &Result<LlmCompletion, LlmGatewayError>,
) -> LlmTelemetryEvent {
    let latency_ms = duration_to_millis(latency);
    match result {
        Ok(completion) => {
            let usage = completion.usage.as_ref();
            LlmTelemetryEvent {
                personality: personality.to_string(),
                outcome: "success",
                latency_ms,
                model: Some(completion.model.clone()),
                prompt_tokens: usage.map(|usage| usage.prompt_tokens),
                completion_tokens: usage.map(|usage| usage.completion_tokens),
                total_tokens: usage.map(|usage| usage.total_tokens),
                error_type: None,
            }
        }
        Err(err) => LlmTelemetryEvent {
            personality: personality.to_string(),
            outcome: "failure",
            latency_ms,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            error_type: Some(err.kind()),
        },
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
