use std::sync::Arc;

use axum::http::{HeaderName, Method, header};
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use shared::personas::PersonalityRegistry;
use shared::relay::MentorRelay;
use shared::repos::{ConversationStore, ProfileStore, SessionStore};
use tower_http::cors::{Any, CorsLayer};

mod chat;
mod errors;
mod health;
mod observability;
mod personalities;
mod profile;
mod sessions;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PersonalityRegistry>,
    pub relay: MentorRelay,
    pub conversations: Arc<dyn ConversationStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub profiles: Arc<dyn ProfileStore>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route(
            "/functions/v1/chat-with-mentor",
            post(chat::chat_with_mentor),
        )
        .route("/v1/chat", post(chat::chat_with_mentor))
        .route("/v1/personalities", get(personalities::list_personalities))
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/v1/sessions/{session_id}",
            delete(sessions::delete_session),
        )
        .route(
            "/v1/sessions/{session_id}/messages",
            get(sessions::list_session_messages),
        )
        .route("/v1/sessions/{session_id}/end", post(sessions::end_session))
        .route(
            "/v1/profile",
            get(profile::get_profile).put(profile::update_profile),
        )
        .layer(middleware::from_fn(
            observability::request_observability_middleware,
        ))
        .layer(cors_layer())
        .with_state(app_state)
}

/// Browser clients call the relay cross-origin with the hosted-function header set.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            header::CONTENT_TYPE,
        ])
        .expose_headers([HeaderName::from_static(
            observability::REQUEST_ID_HEADER,
        )])
}
