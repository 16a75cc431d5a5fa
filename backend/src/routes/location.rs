use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::services::publisher::PublishOutcome;
use crate::services::session::SessionView;
use crate::routes::ApiJson;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_view))
        .route("/start", post(start_tracking))
        .route("/stop", post(stop_tracking))
        .route("/publish", post(publish_location))
        .route("/permission", put(set_permission))
        .route("/watched", get(get_watched))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub passphrase: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub view: SessionView,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PermissionBody {
    pub granted: bool,
}

#[derive(Debug, Serialize)]
pub struct WatchedResponse {
    pub watched: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Current tracking state. Idle when no location screen is open.
async fn get_view(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    let view = match state.slot.current_session().await {
        Some(session) => session.view().await,
        None => SessionView::idle(),
    };
    Json(view)
}

async fn start_tracking(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<StartRequest>,
) -> AppResult<Json<SessionView>> {
    let session = state.slot.session().await;
    let view = session.start(&req.passphrase).await?;
    Ok(Json(view))
}

async fn stop_tracking(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    let Some(session) = state.slot.current_session().await else {
        return Json(StopResponse {
            stopped: false,
            view: SessionView::idle(),
        });
    };

    let stopped = session.stop().await;
    Json(StopResponse {
        stopped,
        view: session.view().await,
    })
}

async fn publish_location(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<PublishRequest>,
) -> AppResult<Json<PublishOutcome>> {
    let outcome = state.publisher.publish(req.lat, req.lon).await?;
    Ok(Json(outcome))
}

async fn set_permission(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<PermissionBody>,
) -> Json<PermissionBody> {
    state.publisher.set_permission(req.granted);
    Json(PermissionBody {
        granted: state.publisher.has_permission(),
    })
}

async fn get_watched(State(state): State<Arc<AppState>>) -> AppResult<Json<WatchedResponse>> {
    let watched = state.publisher.watched().await?;
    Ok(Json(WatchedResponse { watched }))
}
