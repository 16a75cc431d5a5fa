use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod i18n;
mod routes;
mod services;

use config::Config;
use services::init::{self, Backends};
use services::lifecycle::{LifecycleHost, ScreenSlot};
use services::notices::NoticeBoard;
use services::publisher::LocationPublisher;
use services::schedule::ScheduleService;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub notices: NoticeBoard,
    pub slot: ScreenSlot,
    pub publisher: LocationPublisher,
    pub schedules: ScheduleService,
}

impl AppState {
    pub fn new(config: Config, db: sqlx::SqlitePool, backends: Backends) -> Self {
        let notices = NoticeBoard::new(&config.session.language);

        let slot = ScreenSlot::new(
            LifecycleHost::new(),
            backends.realtime.clone(),
            notices.clone(),
            config.session.await_writes,
        );
        let publisher = LocationPublisher::new(backends.realtime, db.clone(), notices.clone());
        let schedules = ScheduleService::new(backends.documents, db.clone(), notices.clone());

        Self {
            db,
            config,
            notices,
            slot,
            publisher,
            schedules,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assist_share=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Assist sharing service");

    // Local preferences database
    let pool = init::init_db(&config).await?;

    // Real-time + document stores
    let backends = init::build_backends(&config)?;

    let app_state = Arc::new(AppState::new(config.clone(), pool, backends));

    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Rate limiter for passphrase-accepting endpoints (location, schedules).
    // The error handler returns a proper 429 status and Retry-After header when limits are exceeded.
    let mut builder = GovernorConfigBuilder::default();
    builder.per_second(config.rate_limit.per_second.into());
    builder.burst_size(config.rate_limit.burst);
    builder.key_extractor(SmartIpKeyExtractor);
    builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                // Same error shape as `AppError -> IntoResponse`
                let body = serde_json::json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "Rate limit exceeded",
                        "details": { "retry_after_seconds": wait_time }
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );

                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }

                if let Ok(retry_after) = HeaderValue::from_str(&wait_time.to_string()) {
                    resp.headers_mut().insert(http::header::RETRY_AFTER, retry_after);
                }

                resp
            }
            GovernorError::UnableToExtractKey => {
                let body = serde_json::json!({
                    "error": {
                        "code": "INVALID_REQUEST",
                        "message": "Unable to determine client IP for rate limiting"
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::from_u16(code.as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });

    let gov_conf = Arc::new(
        builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build rate limiter config"))?,
    );

    // Background cleanup for limiter storage
    let limiter_cleaner = {
        let limiter = gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let allowed_origin = config
        .server
        .allowed_origin
        .parse::<HeaderValue>()
        .map_err(|_| anyhow::anyhow!("Invalid ALLOWED_ORIGIN for CORS"))?;

    // Build router
    let app = routes::router(|r| {
        r.layer(GovernorLayer {
            config: gov_conf.clone(),
        })
    })
    .with_state(app_state.clone())
    .layer(TraceLayer::new_for_http())
    .layer(
        CorsLayer::new()
            .allow_origin(allowed_origin)
            .allow_methods([
                http::Method::GET,
                http::Method::POST,
                http::Method::PUT,
                http::Method::OPTIONS,
            ])
            .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let signal_fut = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {},
                        _ = term.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to bind SIGTERM: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Server future dropped to stop accepting new connections");
        }
    }

    // Leave tracking so the partner's record doesn't keep watcher=true.
    let shutdown_wait = Duration::from_secs(5);
    tracing::info!(
        "Waiting up to {}s for the location screen to close",
        shutdown_wait.as_secs()
    );
    if tokio::time::timeout(shutdown_wait, app_state.slot.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Timed out lowering the watcher flag; it may stay set");
    }

    thread_shutdown.store(true, Ordering::SeqCst);
    if let Err(e) = limiter_cleaner.join() {
        tracing::warn!("Rate limiter cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
