use axum::Json;
use axum::extract::State;
use shared::models::{ListPersonalitiesResponse, PersonalitySummary};

use super::AppState;

pub(super) async fn list_personalities(
    State(state): State<AppState>,
) -> Json<ListPersonalitiesResponse> {
    let items = state
        .registry
        .iter()
        .map(|personality| PersonalitySummary {
            key: personality.key.clone(),
            display_name: personality.display_name.clone(),
        })
        .collect();

    Json(ListPersonalitiesResponse { items })
}
