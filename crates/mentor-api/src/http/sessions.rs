use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use shared::models::{
    CreateSessionRequest, ListMessagesResponse, ListSessionsResponse, OkResponse,
};
use shared::relay::MAX_ID_CHARS;
use shared::repos::DEFAULT_SESSION_LIST_LIMIT;

use super::AppState;
use super::errors::{
    bad_request_response, json_rejection_response, not_found_response, store_error_response,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListSessionsQuery {
    user_id: Option<String>,
}

pub(super) async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };

    let user_id = match validated_id(request.user_id, "userId") {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let personality = request
        .personality
        .map(|value| value.trim().to_string())
        .unwrap_or_default();
    if !state.registry.contains(&personality) {
        return bad_request_response("invalid_request", "personality is unknown");
    }

    match state.sessions.create_session(&user_id, &personality).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(err) => store_error_response(err),
    }
}

pub(super) async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Response {
    let user_id = match validated_id(query.user_id, "userId") {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match state
        .sessions
        .list_sessions(&user_id, DEFAULT_SESSION_LIST_LIMIT)
        .await
    {
        Ok(items) => Json(ListSessionsResponse { items }).into_response(),
        Err(err) => store_error_response(err),
    }
}

pub(super) async fn list_session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.sessions.session_messages(&session_id).await {
        Ok(items) => Json(ListMessagesResponse { items }).into_response(),
        Err(err) => store_error_response(err),
    }
}

pub(super) async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.sessions.end_session(&session_id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => not_found_response("Session not found"),
        Err(err) => store_error_response(err),
    }
}

pub(super) async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.sessions.delete_session(&session_id).await {
        Ok(true) => Json(OkResponse { ok: true }).into_response(),
        Ok(false) => not_found_response("Session not found"),
        Err(err) => store_error_response(err),
    }
}

pub(super) fn validated_id(value: Option<String>, field: &str) -> Result<String, Response> {
    let value = value.map(|value| value.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(bad_request_response(
            "invalid_request",
            &format!("{field} is required"),
        ));
    }
    if value.chars().count() > MAX_ID_CHARS {
        return Err(bad_request_response(
            "invalid_request",
            &format!("{field} must be at most {MAX_ID_CHARS} characters"),
        ));
    }
    Ok(value)
}
