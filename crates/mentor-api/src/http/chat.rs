use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use shared::models::{ChatWithMentorRequest, ChatWithMentorResponse};
use tracing::info;

use super::AppState;
use super::errors::{json_rejection_response, relay_error_response};
use super::observability::{RequestContext, TurnOutcome};

pub(super) async fn chat_with_mentor(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<ChatWithMentorRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };

    match state.relay.handle_turn(request.into()).await {
        Ok(reply) => {
            info!(
                request_id = %context.request_id,
                used_fallback = reply.used_fallback,
                "mentor turn completed"
            );
            let mut response = Json(ChatWithMentorResponse {
                response: reply.response,
            })
            .into_response();
            response.extensions_mut().insert(TurnOutcome {
                used_fallback: reply.used_fallback,
            });
            response
        }
        Err(err) => relay_error_response(err),
    }
}
