use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::config::BackendKind;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub backend: BackendKind,
    pub tracking: bool,
    pub sending_schedule: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tracking = match state.slot.current_session().await {
        Some(session) => session.is_tracking().await,
        None => false,
    };

    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        backend: state.config.backend,
        tracking,
        sending_schedule: state.schedules.is_sending(),
    };

    (StatusCode::OK, Json(response))
}
