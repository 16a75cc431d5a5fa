//! Initialization helpers for the application:
//! - database connection + migrations
//! - real-time and document store selection
//!
//! This module centralizes bits that would otherwise live in `main.rs`.

use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::config::{BackendKind, Config};
use crate::services::documents::{DocumentStore, MemoryDocumentStore};
use crate::services::firebase::{FirebaseRealtimeStore, FirestoreDocumentStore};
use crate::services::realtime::{MemoryRealtimeStore, RealtimeStore};

/// Redact potentially sensitive information from a URL before logging.
///
/// Removes userinfo and query parameters (RTDB `auth=`, Firestore `key=`).
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_url(raw: &str) -> String {
    if let Ok(url) = url::Url::parse(raw) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = raw.find('@') {
            let without_creds = &raw[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Open the local preferences database and run migrations.
///
/// Creates the parent directory for the database file (if applicable) and
/// opens the pool with `create_if_missing(true)`.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Opening preferences database: {}", redact_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub struct Backends {
    pub realtime: Arc<dyn RealtimeStore>,
    pub documents: Arc<dyn DocumentStore>,
}

/// Build the real-time and document stores selected by `BACKEND`.
pub fn build_backends(config: &Config) -> Result<Backends> {
    match config.backend {
        BackendKind::Memory => {
            tracing::warn!("Using in-memory backends; shared data is lost on exit");
            Ok(Backends {
                realtime: Arc::new(MemoryRealtimeStore::new()),
                documents: Arc::new(MemoryDocumentStore::new()),
            })
        }
        BackendKind::Firebase => {
            let realtime = FirebaseRealtimeStore::new(&config.firebase)?;
            let documents = FirestoreDocumentStore::new(&config.firebase)?;
            tracing::info!(
                "Using Firebase backends: {} / project {}",
                redact_url(config.firebase.database_url.as_deref().unwrap_or_default()),
                config.firebase.project_id.as_deref().unwrap_or_default()
            );
            Ok(Backends {
                realtime: Arc::new(realtime),
                documents: Arc::new(documents),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_credentials_and_query() {
        assert_eq!(
            redact_url("https://user:pw@demo.firebaseio.com/root.json?auth=secret"),
            "https://demo.firebaseio.com/root.json"
        );
        assert_eq!(redact_url("not a url@host"), "(redacted)host");
        assert_eq!(redact_url("plain"), "(redacted)");
    }

    #[test]
    fn memory_backend_builds_without_credentials() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Memory);
        assert!(build_backends(&config).is_ok());
    }

    #[test]
    fn firebase_backend_needs_a_database_url() {
        let mut config = Config::default();
        config.backend = BackendKind::Firebase;
        config.firebase.project_id = Some("demo".to_string());
        assert!(build_backends(&config).is_err());

        config.firebase.database_url = Some("https://demo.firebaseio.com".to_string());
        assert!(build_backends(&config).is_ok());
    }
}
