//! The per-turn mentor pipeline: validate, persist the user message, assemble
//! the prompt from recent history, call the model, persist the reply.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::{
    ChatTurn, CompletionOptions, LlmGateway, LlmGatewayError, LlmGatewayRequest,
    generate_with_telemetry, log_llm_telemetry,
};
use crate::models::{ChatWithMentorRequest, MessageRole, NewMessage};
use crate::personas::{Personality, PersonalityRegistry};
use crate::repos::{ConversationStore, StoreError};

mod locks;
mod throttle;

pub use locks::{SessionTurnGuard, SessionTurnLocks};
pub use throttle::{ThrottleRejection, ThrottleScope, TurnThrottle, TurnThrottleConfig};

pub const MAX_MESSAGE_CHARS: usize = 8_000;
pub const MAX_ID_CHARS: usize = 128;

/// Stored and returned when the provider answers 2xx without usable text.
pub const FALLBACK_REPLY: &str =
    "I'm having trouble finding the right words just now. Could you say that another way?";

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: Option<String>,
    pub personality: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl From<ChatWithMentorRequest> for TurnRequest {
    fn from(request: ChatWithMentorRequest) -> Self {
        Self {
            message: request.message,
            personality: request.personality,
            session_id: request.session_id,
            user_id: request.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub response: String,
    pub used_fallback: bool,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("too many turns scope={} retry_after_seconds={}", .0.scope.as_str(), .0.retry_after_seconds)]
    Throttled(ThrottleRejection),
    #[error("conversation store failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("language model failure: {0}")]
    Upstream(#[from] LlmGatewayError),
}

struct ValidatedTurn<'r> {
    personality: &'r Personality,
    message: String,
    session_id: String,
    user_id: String,
}

#[derive(Clone)]
pub struct MentorRelay {
    registry: Arc<PersonalityRegistry>,
    store: Arc<dyn ConversationStore>,
    gateway: Arc<dyn LlmGateway>,
    history_window: usize,
    locks: Option<SessionTurnLocks>,
    throttle: Option<TurnThrottle>,
}

impl MentorRelay {
    pub fn new(
        registry: Arc<PersonalityRegistry>,
        store: Arc<dyn ConversationStore>,
        gateway: Arc<dyn LlmGateway>,
        history_window: usize,
    ) -> Self {
        Self {
            registry,
            store,
            gateway,
            history_window,
            locks: None,
            throttle: None,
        }
    }

    pub fn with_session_locks(mut self, locks: SessionTurnLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_throttle(mut self, throttle: TurnThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn registry(&self) -> &PersonalityRegistry {
        &self.registry
    }

    /// Runs exactly one conversational turn.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnReply, RelayError> {
        let turn = self.validate(request)?;
        if let Some(throttle) = &self.throttle {
            throttle.admit(&turn.user_id).map_err(RelayError::Throttled)?;
        }

        let _turn_guard = match &self.locks {
            Some(locks) => Some(locks.acquire(&turn.session_id).await),
            None => None,
        };
        // Fail fast while the provider is known to be down, before anything is stored.
        self.gateway.check_available()?;

        let inbound = self
            .store
            .append(NewMessage {
                session_id: turn.session_id.clone(),
                user_id: turn.user_id.clone(),
                role: MessageRole::User,
                content: turn.message.clone(),
            })
            .await?;

        let window = self
            .store
            .recent_history(&turn.session_id, self.history_window)
            .await?;
        let history = window
            .into_iter()
            .filter(|message| message.id != inbound.id)
            .map(|message| ChatTurn {
                role: message.role,
                content: message.content,
            })
            .collect::<Vec<_>>();
        debug!(
            session_id = turn.session_id.as_str(),
            personality = turn.personality.key.as_str(),
            history_len = history.len(),
            "assembled mentor prompt"
        );

        let request = LlmGatewayRequest::new(&turn.personality.system_prompt, &turn.message)
            .with_history(history)
            .with_options(CompletionOptions {
                temperature: turn.personality.temperature,
                max_tokens: turn.personality.max_tokens,
            })
            .with_requester_id(&turn.user_id);

        let (result, telemetry) =
            generate_with_telemetry(self.gateway.as_ref(), &turn.personality.key, request).await;
        log_llm_telemetry(&turn.session_id, &turn.user_id, &telemetry);

        let (response, used_fallback) = match result {
            Ok(completion) => (completion.text, false),
            Err(LlmGatewayError::InvalidProviderPayload(reason)) => {
                warn!(
                    session_id = turn.session_id.as_str(),
                    reason = reason.as_str(),
                    "provider reply had no usable text, using fallback reply"
                );
                (FALLBACK_REPLY.to_string(), true)
            }
            Err(err) => return Err(RelayError::Upstream(err)),
        };

        self.store
            .append(NewMessage {
                session_id: turn.session_id,
                user_id: turn.user_id,
                role: MessageRole::Assistant,
                content: response.clone(),
            })
            .await?;

        Ok(TurnReply {
            response,
            used_fallback,
        })
    }

    fn validate(&self, request: TurnRequest) -> Result<ValidatedTurn<'_>, RelayError> {
        let message = required_field(request.message, "message")?;
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(RelayError::Validation(format!(
                "message must be at most {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let personality_key = required_field(request.personality, "personality")?;
        let session_id = required_id(request.session_id, "sessionId")?;
        let user_id = required_id(request.user_id, "userId")?;

        let personality = self
            .registry
            .lookup(personality_key.trim())
            .ok_or_else(|| {
                RelayError::Validation(format!("unknown personality: {}", personality_key.trim()))
            })?;

        Ok(ValidatedTurn {
            personality,
            message,
            session_id,
            user_id,
        })
    }
}

/// Rejects missing or blank values; the value itself is kept as sent.
fn required_field(value: Option<String>, field: &str) -> Result<String, RelayError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(RelayError::Validation(format!("{field} is required"))),
    }
}

fn required_id(value: Option<String>, field: &str) -> Result<String, RelayError> {
    let value = required_field(value, field)?.trim().to_string();
    if value.chars().count() > MAX_ID_CHARS {
        return Err(RelayError::Validation(format!(
            "{field} must be at most {MAX_ID_CHARS} characters"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::llm::{
        CircuitBreakerConfig, CircuitBreakerGateway, LlmCompletion, LlmGateway, LlmGatewayError,
        LlmGatewayFuture, LlmGatewayRequest,
    };
    use crate::models::{Message, MessageRole, NewMessage};
    use crate::personas::PersonalityRegistry;
    use crate::repos::{ConversationStore, MemoryStore, StoreError, StoreFuture};

    use super::{
        FALLBACK_REPLY, MentorRelay, RelayError, SessionTurnLocks, ThrottleScope, TurnRequest,
        TurnThrottle, TurnThrottleConfig,
    };

    enum StubReply {
        Text(&'static str),
        NoText,
        RateLimitedUpstream,
    }

    struct StubGateway {
        reply: StubReply,
        requests: Mutex<Vec<LlmGatewayRequest>>,
    }

    impl StubGateway {
        fn new(reply: StubReply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }

        fn last_request(&self) -> LlmGatewayRequest {
            self.requests
                .lock()
                .expect("requests lock")
                .last()
                .cloned()
                .expect("gateway should have been called")
        }
    }

    impl LlmGateway for StubGateway {
        fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a> {
            self.requests.lock().expect("requests lock").push(request);
            let result = match self.reply {
                StubReply::Text(text) => Ok(LlmCompletion {
                    model: "stub-model".to_string(),
                    provider_request_id: None,
                    text: text.to_string(),
                    usage: None,
                }),
                StubReply::NoText => Err(LlmGatewayError::InvalidProviderPayload(
                    "missing_completion_text".to_string(),
                )),
                StubReply::RateLimitedUpstream => Err(LlmGatewayError::ProviderFailure(
                    "status=429 code=unknown".to_string(),
                )),
            };
            Box::pin(async move { result })
        }
    }

    struct FailingStore;

    impl ConversationStore for FailingStore {
        fn append<'a>(&'a self, _message: NewMessage) -> StoreFuture<'a, Message> {
            Box::pin(async { Err(StoreError::InvalidData("store offline".to_string())) })
        }

        fn recent_history<'a>(
            &'a self,
            _session_id: &'a str,
            _limit: usize,
        ) -> StoreFuture<'a, Vec<Message>> {
            Box::pin(async { Err(StoreError::InvalidData("store offline".to_string())) })
        }

        fn ping<'a>(&'a self) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(StoreError::InvalidData("store offline".to_string())) })
        }
    }

    fn relay_with(
        store: Arc<dyn ConversationStore>,
        gateway: Arc<StubGateway>,
        history_window: usize,
    ) -> MentorRelay {
        MentorRelay::new(
            Arc::new(PersonalityRegistry::builtin()),
            store,
            gateway,
            history_window,
        )
        .with_session_locks(SessionTurnLocks::new())
    }

    fn turn(message: &str, personality: &str) -> TurnRequest {
        TurnRequest {
            message: Some(message.to_string()),
            personality: Some(personality.to_string()),
            session_id: Some("s1".to_string()),
            user_id: Some("u1".to_string()),
        }
    }

    #[tokio::test]
    async fn successful_turn_appends_user_then_assistant() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::Text("Take a breath, sir."));
        let relay = relay_with(store.clone(), gateway.clone(), 10);

        let reply = relay
            .handle_turn(turn("I'm stressed", "jarvis"))
            .await
            .expect("turn should succeed");

        assert_eq!(reply.response, "Take a breath, sir.");
        assert!(!reply.used_fallback);

        let messages = store.all_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "I'm stressed");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Take a breath, sir.");

        let request = gateway.last_request();
        let jarvis = PersonalityRegistry::builtin()
            .lookup("jarvis")
            .cloned()
            .expect("jarvis is builtin");
        assert_eq!(request.system_prompt, jarvis.system_prompt);
        assert_eq!(request.user_message, "I'm stressed");
        assert!(request.history.is_empty());
        assert_eq!(request.options.temperature, jarvis.temperature);
        assert_eq!(request.requester_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn unknown_personality_touches_neither_store_nor_model() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::Text("unused"));
        let relay = relay_with(store.clone(), gateway.clone(), 10);

        let err = relay
            .handle_turn(turn("hi", "unknown"))
            .await
            .expect_err("unknown personality must fail");

        assert!(matches!(err, RelayError::Validation(_)));
        assert!(store.all_messages().await.is_empty());
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn missing_or_blank_fields_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::Text("unused"));
        let relay = relay_with(store.clone(), gateway.clone(), 10);

        let mut missing_session = turn("hi", "sage");
        missing_session.session_id = None;
        let blank_message = turn("   ", "sage");
        let oversized = turn(&"a".repeat(super::MAX_MESSAGE_CHARS + 1), "sage");

        for request in [missing_session, blank_message, oversized] {
            let err = relay
                .handle_turn(request)
                .await
                .expect_err("invalid request must fail");
            assert!(matches!(err, RelayError::Validation(_)));
        }
        assert!(store.all_messages().await.is_empty());
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn inbound_persist_failure_never_calls_model() {
        let gateway = StubGateway::new(StubReply::Text("unused"));
        let relay = relay_with(Arc::new(FailingStore), gateway.clone(), 10);

        let err = relay
            .handle_turn(turn("hello", "vegeta"))
            .await
            .expect_err("store failure must fail the turn");

        assert!(matches!(err, RelayError::Persistence(_)));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_only_the_user_message() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::RateLimitedUpstream);
        let relay = relay_with(store.clone(), gateway.clone(), 10);

        let err = relay
            .handle_turn(turn("hello", "calm-guru"))
            .await
            .expect_err("upstream failure must fail the turn");

        assert!(matches!(err, RelayError::Upstream(_)));
        let messages = store.all_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn unusable_success_body_stores_fallback_reply() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::NoText);
        let relay = relay_with(store.clone(), gateway, 10);

        let reply = relay
            .handle_turn(turn("hello", "sage"))
            .await
            .expect("fallback reply should succeed");

        assert_eq!(reply.response, FALLBACK_REPLY);
        assert!(reply.used_fallback);
        let messages = store.all_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn history_is_bounded_and_excludes_current_message() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::Text("ok"));
        let relay = relay_with(store.clone(), gateway.clone(), 4);

        for index in 0..3 {
            relay
                .handle_turn(turn(&format!("message {index}"), "jarvis"))
                .await
                .expect("turn should succeed");
        }

        let request = gateway.last_request();
        assert_eq!(request.user_message, "message 2");
        assert_eq!(request.history.len(), 3);
        assert_eq!(request.history[0].role, MessageRole::Assistant);
        assert_eq!(request.history[1].content, "message 1");
        assert_eq!(request.history[2].content, "ok");
        assert!(
            request
                .history
                .iter()
                .all(|turn| turn.content != "message 2")
        );
    }

    #[tokio::test]
    async fn fallback_survives_repeated_unusable_bodies_behind_circuit_breaker() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubGateway::new(StubReply::NoText);
        let config = CircuitBreakerConfig::default();
        let turns = config.failure_threshold as usize + 3;
        let gateway = CircuitBreakerGateway::new(stub.clone(), config)
            .expect("breaker should build");
        let relay = MentorRelay::new(
            Arc::new(PersonalityRegistry::builtin()),
            store.clone(),
            Arc::new(gateway),
            10,
        );

        for index in 0..turns {
            let reply = relay
                .handle_turn(turn(&format!("message {index}"), "sage"))
                .await
                .expect("unusable bodies must keep degrading to the fallback reply");
            assert!(reply.used_fallback);
            assert_eq!(reply.response, FALLBACK_REPLY);
        }

        assert_eq!(stub.calls(), turns);
        assert_eq!(store.all_messages().await.len(), turns * 2);
    }

    #[tokio::test]
    async fn open_circuit_rejects_turn_before_anything_is_stored() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubGateway::new(StubReply::RateLimitedUpstream);
        let gateway = CircuitBreakerGateway::new(
            stub.clone(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_seconds: 60,
            },
        )
        .expect("breaker should build");
        let relay = MentorRelay::new(
            Arc::new(PersonalityRegistry::builtin()),
            store.clone(),
            Arc::new(gateway),
            10,
        );

        let first = relay
            .handle_turn(turn("hello", "jarvis"))
            .await
            .expect_err("provider failure must fail the turn");
        assert!(matches!(
            first,
            RelayError::Upstream(LlmGatewayError::ProviderFailure(_))
        ));
        let second = relay
            .handle_turn(turn("hello again", "jarvis"))
            .await
            .expect_err("open circuit must fail the turn");
        assert!(matches!(
            second,
            RelayError::Upstream(LlmGatewayError::CircuitOpen { .. })
        ));

        assert_eq!(stub.calls(), 1);
        let messages = store.all_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn throttled_turn_has_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new(StubReply::Text("ok"));
        let throttle = TurnThrottle::new(TurnThrottleConfig {
            per_user_max_turns: 1,
            ..TurnThrottleConfig::default()
        })
        .expect("throttle should build");
        let relay = relay_with(store.clone(), gateway.clone(), 10).with_throttle(throttle);

        relay
            .handle_turn(turn("one", "sage"))
            .await
            .expect("first turn should pass");
        let err = relay
            .handle_turn(turn("two", "sage"))
            .await
            .expect_err("second turn should be throttled");

        assert!(matches!(
            err,
            RelayError::Throttled(rejection) if rejection.scope == ThrottleScope::User
        ));
        assert_eq!(gateway.calls(), 1);
        assert_eq!(store.all_messages().await.len(), 2);
    }
}
