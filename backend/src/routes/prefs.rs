use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::services::my_key::{GeneratedKey, MyKeyService, MyKeyView};
use crate::routes::ApiJson;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/my-key", get(get_my_key).put(set_my_key))
        .route("/my-key/generate", post(generate_my_key))
}

#[derive(Debug, Deserialize)]
pub struct SetMyKeyRequest {
    pub passphrase: String,
}

async fn get_my_key(State(state): State<Arc<AppState>>) -> AppResult<Json<MyKeyView>> {
    Ok(Json(MyKeyService::get(&state.db).await?))
}

async fn set_my_key(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SetMyKeyRequest>,
) -> AppResult<Json<MyKeyView>> {
    Ok(Json(
        MyKeyService::set(&state.db, &state.notices, &req.passphrase).await?,
    ))
}

/// Create a random passphrase, store its key and hand the passphrase back
/// so the user can share it.
async fn generate_my_key(State(state): State<Arc<AppState>>) -> AppResult<Json<GeneratedKey>> {
    Ok(Json(MyKeyService::generate(&state.db).await?))
}
