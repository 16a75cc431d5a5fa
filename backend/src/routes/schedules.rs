use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::{AppErrorWithDetails, AppResult};
use crate::services::schedule::{ScheduleDraft, SentSchedule, SharedSchedule};
use crate::routes::ApiJson;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(send_schedule))
        .route("/inbox", get(get_inbox))
}

async fn send_schedule(
    State(state): State<Arc<AppState>>,
    ApiJson(draft): ApiJson<ScheduleDraft>,
) -> Result<(StatusCode, Json<SentSchedule>), AppErrorWithDetails> {
    let sent = state.schedules.send(draft).await?;
    Ok((StatusCode::CREATED, Json(sent)))
}

/// Schedules other people sent to my key, newest first.
async fn get_inbox(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<SharedSchedule>>> {
    Ok(Json(state.schedules.inbox().await?))
}
