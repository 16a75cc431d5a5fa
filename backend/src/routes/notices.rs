use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::services::notices::Notice;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(drain_notices))
}

/// Hand over every pending notice. Each one is returned once.
async fn drain_notices(State(state): State<Arc<AppState>>) -> Json<Vec<Notice>> {
    Json(state.notices.drain())
}
