use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::services::lifecycle::LifecycleEvent;
use crate::routes::ApiJson;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(dispatch_event))
}

#[derive(Debug, Deserialize)]
pub struct LifecycleRequest {
    pub event: LifecycleEvent,
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub event: LifecycleEvent,
    /// Bound observers that received the event.
    pub observers: usize,
    pub screen_open: bool,
}

/// Forward a foreground/background transition from the shell.
async fn dispatch_event(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<LifecycleRequest>,
) -> Json<LifecycleResponse> {
    let observers = state.slot.dispatch(req.event).await;
    let screen_open = state.slot.current_session().await.is_some();

    Json(LifecycleResponse {
        event: req.event,
        observers,
        screen_open,
    })
}
