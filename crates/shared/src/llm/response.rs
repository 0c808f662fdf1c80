//! Extraction of completion text from provider response bodies.
//!
//! Providers disagree on envelope shape; the shape is picked by the configured
//! provider rather than sniffed per response.

use serde_json::Value;

use super::gateway::LlmTokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `choices[0].message.content`
    ChatCompletions,
    /// `candidates[0].content.parts[*].text`, `generated_text`, or
    /// `[{"generated_text": ...}]`.
    RawGeneration,
}

impl ResponseShape {
    /// Returns the completion text, or `None` when the body carries no usable
    /// (non-blank) text in this shape.
    pub fn extract_text(self, body: &Value) -> Option<String> {
        let text = match self {
            Self::ChatCompletions => chat_completions_text(body),
            Self::RawGeneration => {
                gemini_candidates_text(body).or_else(|| generated_text(body))
            }
        }?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn extract_usage(self, body: &Value) -> Option<LlmTokenUsage> {
        match self {
            Self::ChatCompletions => {
                let usage = body.get("usage")?;
                Some(LlmTokenUsage {
                    prompt_tokens: token_count(usage, "prompt_tokens"),
                    completion_tokens: token_count(usage, "completion_tokens"),
                    total_tokens: token_count(usage, "total_tokens"),
                })
            }
            Self::RawGeneration => {
                let usage = body.get("usageMetadata")?;
                Some(LlmTokenUsage {
                    prompt_tokens: token_count(usage, "promptTokenCount"),
                    completion_tokens: token_count(usage, "candidatesTokenCount"),
                    total_tokens: token_count(usage, "totalTokenCount"),
                })
            }
        }
    }

    pub fn extract_model(self, body: &Value) -> Option<String> {
        let key = match self {
            Self::ChatCompletions => "model",
            Self::RawGeneration => "modelVersion",
        };
        body.get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    pub fn extract_request_id(self, body: &Value) -> Option<String> {
        let key = match self {
            Self::ChatCompletions => "id",
            Self::RawGeneration => "responseId",
        };
        body.get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

fn chat_completions_text(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(ToString::to_string)
}

fn gemini_candidates_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let joined = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if joined.is_empty() { None } else { Some(joined) }
}

fn generated_text(body: &Value) -> Option<String> {
    let entry = match body {
        Value::Array(items) => items.first()?,
        other => other,
    };
    entry
        .get("generated_text")?
        .as_str()
        .map(ToString::to_string)
}

fn token_count(usage: &Value, key: &str) -> u32 {
    usage
        .get(key)
        .and_then(Value::as_u64)
        .map(|value| value.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}
