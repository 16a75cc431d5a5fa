use std::sync::Arc;

use axum::{extract::FromRequest, routing::get, Router};

use crate::error::AppError;
use crate::AppState;

pub mod health;
pub mod lifecycle;
pub mod location;
pub mod notices;
pub mod prefs;
pub mod schedules;
pub mod webview;

/// JSON body extractor whose rejections render as [`AppError`].
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Build the full router. `throttle` wraps the routers that accept
/// passphrases (location sharing and schedule sending).
pub fn router<F>(throttle: F) -> Router<Arc<AppState>>
where
    F: Fn(Router<Arc<AppState>>) -> Router<Arc<AppState>>,
{
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Location sharing (tracking session + my own position)
        .nest("/api/location", throttle(location::router()))
        // Schedule sharing
        .nest("/api/schedules", throttle(schedules::router()))
        // Foreground/background transitions from the shell
        .nest("/api/lifecycle", lifecycle::router())
        // Locally persisted preferences ("my key")
        .nest("/api/prefs", prefs::router())
        .nest("/api/webview", webview::router())
        .nest("/api/notices", notices::router())
}
