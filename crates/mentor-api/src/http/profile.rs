use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use shared::models::UpdateProfileRequest;

use super::AppState;
use super::errors::{
    bad_request_response, json_rejection_response, not_found_response, store_error_response,
};
use super::sessions::validated_id;

const MAX_DISPLAY_NAME_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProfileQuery {
    user_id: Option<String>,
}

pub(super) async fn get_profile(
    State(state): State<AppState>,
    Query(query): Query<ProfileQuery>,
) -> Response {
    let user_id = match validated_id(query.user_id, "userId") {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match state.profiles.get_profile(&user_id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => not_found_response("Profile not found"),
        Err(err) => store_error_response(err),
    }
}

pub(super) async fn update_profile(
    State(state): State<AppState>,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };

    let user_id = match validated_id(request.user_id, "userId") {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let display_name = request
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    if display_name
        .as_ref()
        .is_some_and(|name| name.chars().count() > MAX_DISPLAY_NAME_CHARS)
    {
        return bad_request_response(
            "invalid_request",
            &format!("displayName must be at most {MAX_DISPLAY_NAME_CHARS} characters"),
        );
    }

    match state
        .profiles
        .save_profile(&user_id, display_name.as_deref())
        .await
    {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => store_error_response(err),
    }
}
