#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri, header};
use axum::{Json, Router};
use mentor_api::http::{AppState, build_router};
use serde_json::{Value, json};
use shared::llm::{
    CircuitBreakerConfig, CircuitBreakerGateway, ModelRoute, ProviderConfig, ProviderGateway,
    ProviderKind,
};
use shared::personas::PersonalityRegistry;
use shared::relay::{MentorRelay, SessionTurnLocks, TurnThrottle, TurnThrottleConfig};
use shared::repos::{MemoryStore, Store};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OnceCell, oneshot};
use tower::ServiceExt;

const TEST_DATABASE_URL_ENV: &str = "TEST_DATABASE_URL";

static MIGRATIONS_APPLIED: OnceCell<()> = OnceCell::const_new();

#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub body: Value,
}

impl UpstreamReply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn chat_completion(text: &str) -> Self {
        Self::ok(json!({
            "id": "chatcmpl-test",
            "model": "test-model",
            "choices": [{"message": {"role": "assistant", "content": text}}]
        }))
    }

    pub fn error(status: StatusCode, code: &str) -> Self {
        Self {
            status,
            body: json!({"error": {"code": code}}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenUpstreamRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    replies: Arc<Mutex<VecDeque<UpstreamReply>>>,
    seen: Arc<Mutex<Vec<SeenUpstreamRequest>>>,
}

/// Local stand-in for the completion provider.
pub struct MockUpstream {
    pub base_url: String,
    state: UpstreamState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockUpstream {
    pub async fn start(replies: Vec<UpstreamReply>) -> Self {
        let state = UpstreamState {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .fallback(upstream_handler)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let local_addr = listener
            .local_addr()
            .expect("listener address should resolve");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            server.await.expect("mock upstream should run");
        });

        Self {
            base_url: format!("http://{local_addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub async fn seen(&self) -> Vec<SeenUpstreamRequest> {
        self.state.seen.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn upstream_handler(
    State(state): State<UpstreamState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.seen.lock().await.push(SeenUpstreamRequest {
        path: uri.path().to_string(),
        headers,
        body,
    });

    let reply = state
        .replies
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(|| UpstreamReply::error(StatusCode::INTERNAL_SERVER_ERROR, "no_reply"));
    (reply.status, Json(reply.body))
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub upstream: MockUpstream,
}

pub async fn test_app(replies: Vec<UpstreamReply>) -> TestApp {
    test_app_with_throttle(replies, TurnThrottleConfig::default()).await
}

pub async fn test_app_with_throttle(
    replies: Vec<UpstreamReply>,
    throttle: TurnThrottleConfig,
) -> TestApp {
    let upstream = MockUpstream::start(replies).await;
    let provider = ProviderGateway::new(ProviderConfig {
        kind: ProviderKind::OpenAi,
        endpoint_url: format!("{}/chat/completions", upstream.base_url),
        api_key: "integration-test-key".to_string(),
        timeout_ms: 2_000,
        max_retries: 0,
        retry_base_backoff_ms: 0,
        model_route: ModelRoute {
            primary_model: "test-model".to_string(),
            fallback_model: None,
        },
    })
    .expect("provider gateway should build");
    let gateway = CircuitBreakerGateway::new(provider, CircuitBreakerConfig::default())
        .expect("circuit breaker should build");
    let throttle = TurnThrottle::new(throttle).expect("throttle should build");

    let registry = Arc::new(PersonalityRegistry::builtin());
    let store = Arc::new(MemoryStore::new());
    let relay = MentorRelay::new(registry.clone(), store.clone(), Arc::new(gateway), 10)
        .with_session_locks(SessionTurnLocks::new())
        .with_throttle(throttle);

    let router = build_router(AppState {
        registry,
        relay,
        conversations: store.clone(),
        sessions: store.clone(),
        profiles: store.clone(),
    });

    TestApp {
        router,
        store,
        upstream,
    }
}

/// Postgres-backed store for tests that exercise the SQL; `None` when
/// `TEST_DATABASE_URL` is not set.
pub async fn test_store() -> Option<Store> {
    let database_url = std::env::var(TEST_DATABASE_URL_ENV).ok()?;
    let store = Store::connect(&database_url, 5)
        .await
        .expect("test store connection should succeed");

    MIGRATIONS_APPLIED
        .get_or_init(|| async {
            let migrations_dir =
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../db/migrations");
            let migrator = sqlx::migrate::Migrator::new(migrations_dir)
                .await
                .expect("migrations should load");
            migrator
                .run(store.pool())
                .await
                .expect("migrations should apply");
        })
        .await;

    Some(store)
}

pub struct JsonResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(app: &Router, request: Request<Body>) -> JsonResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");
    let body = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));

    JsonResponse {
        status,
        headers,
        body,
    }
}

pub fn request(method: Method, uri: &str, json_body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match json_body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    }
}

pub fn chat_body(message: &str, personality: &str) -> Value {
    json!({
        "message": message,
        "personality": personality,
        "sessionId": "s1",
        "userId": "u1"
    })
}

pub fn error_code(body: &Value) -> Option<&str> {
    body.get("code").and_then(Value::as_str)
}

pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
