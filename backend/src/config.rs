use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub backend: BackendKind,
    pub firebase: FirebaseConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub webview: WebViewConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS (the shell's web content origin).
    pub allowed_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Which implementation backs the real-time and document stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local stores. Useful for development and tests.
    Memory,
    /// Firebase Realtime Database + Cloud Firestore over REST.
    Firebase,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "memory" | "mem" => Some(BackendKind::Memory),
            "firebase" => Some(BackendKind::Firebase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseConfig {
    /// Realtime Database root, e.g. `https://<project>-default-rtdb.firebaseio.com`
    pub database_url: Option<String>,
    pub project_id: Option<String>,
    /// Web API key appended to Firestore requests as `?key=`.
    pub api_key: Option<String>,
    /// ID token or database secret. Sent as `?auth=` (RTDB) and bearer token (Firestore).
    pub auth_token: Option<String>,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Await watcher flag writes before changing session state.
    /// Read from env var `SESSION_AWAIT_WRITES` ("true"/"false", "1"/"0", "yes"/"no").
    pub await_writes: bool,
    /// Language used for user-visible notices (`ko` or `en`).
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for passphrase endpoints
    pub per_second: u32,
    /// Burst size for passphrase endpoints
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebViewConfig {
    pub url: String,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        _ => Err(ConfigError::InvalidValue(name.to_string())),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let backend = match env::var("BACKEND") {
            Ok(v) => BackendKind::parse(&v)
                .ok_or_else(|| ConfigError::InvalidValue("BACKEND".to_string()))?,
            Err(_) => BackendKind::Memory,
        };

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                allowed_origin: env::var("ALLOWED_ORIGIN")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/prefs.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            backend,
            firebase: FirebaseConfig {
                database_url: env::var("FIREBASE_DATABASE_URL").ok(),
                project_id: env::var("FIREBASE_PROJECT_ID").ok(),
                api_key: env::var("FIREBASE_API_KEY").ok(),
                auth_token: env::var("FIREBASE_AUTH_TOKEN").ok(),
                request_timeout_seconds: env::var("FIREBASE_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            session: SessionConfig {
                await_writes: env::var("SESSION_AWAIT_WRITES")
                    .ok()
                    .and_then(|v| parse_bool(&v))
                    .unwrap_or(false),
                language: env::var("LANGUAGE")
                    .map(|v| crate::i18n::normalize_language(&v))
                    .unwrap_or_else(|_| crate::i18n::DEFAULT_LANG.to_string()),
            },
            rate_limit: RateLimitConfig {
                per_second: env::var("RATE_LIMIT_PER_SECOND")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                burst: env::var("RATE_LIMIT_BURST")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            webview: WebViewConfig {
                url: env::var("WEBVIEW_URL")
                    .unwrap_or_else(|_| "http://www.hsb.or.kr/".to_string()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that can't be expressed per variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("WEBVIEW_URL", &self.webview.url)?;

        if !crate::i18n::is_supported_language(&self.session.language) {
            return Err(ConfigError::InvalidValue("LANGUAGE".to_string()));
        }

        if self.backend == BackendKind::Firebase {
            let db_url = self
                .firebase
                .database_url
                .as_deref()
                .ok_or_else(|| ConfigError::MissingEnv("FIREBASE_DATABASE_URL".to_string()))?;
            validate_http_url("FIREBASE_DATABASE_URL", db_url)?;

            if self.firebase.project_id.is_none() {
                return Err(ConfigError::MissingEnv("FIREBASE_PROJECT_ID".to_string()));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                allowed_origin: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/prefs.db".to_string(),
                max_connections: 5,
            },
            backend: BackendKind::Memory,
            firebase: FirebaseConfig {
                database_url: None,
                project_id: None,
                api_key: None,
                auth_token: None,
                request_timeout_seconds: 30,
            },
            session: SessionConfig {
                await_writes: false,
                language: crate::i18n::DEFAULT_LANG.to_string(),
            },
            rate_limit: RateLimitConfig {
                per_second: 2,
                burst: 10,
            },
            webview: WebViewConfig {
                url: "http://www.hsb.or.kr/".to_string(),
            },
        }
    }
}
