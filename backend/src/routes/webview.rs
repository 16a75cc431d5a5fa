use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_webview))
}

#[derive(Debug, Serialize)]
pub struct WebViewResponse {
    pub url: String,
}

/// Start page for the shell's embedded browser.
async fn get_webview(State(state): State<Arc<AppState>>) -> Json<WebViewResponse> {
    Json(WebViewResponse {
        url: state.config.webview.url.clone(),
    })
}
