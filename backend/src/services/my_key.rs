use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::PreferenceRepository;
use crate::error::{AppError, AppResult};
use crate::services::keys::{derive_key, key_fingerprint, DerivedKey};
use crate::services::notices::NoticeBoard;

pub const GENERATED_PASSPHRASE_LEN: usize = 8;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn generate_passphrase() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_PASSPHRASE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct MyKeyView {
    pub key: Option<DerivedKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedKey {
    /// What the user hands to their partner. Not stored.
    pub passphrase: String,
    pub key: DerivedKey,
}

/// The locally stored "my key" that addresses my own location record and
/// my schedule inbox.
pub struct MyKeyService;

impl MyKeyService {
    pub async fn get(pool: &SqlitePool) -> AppResult<MyKeyView> {
        Ok(MyKeyView {
            key: PreferenceRepository::my_key(pool).await?,
        })
    }

    pub async fn set(pool: &SqlitePool, notices: &NoticeBoard, passphrase: &str) -> AppResult<MyKeyView> {
        if passphrase.is_empty() {
            return Err(AppError::Validation(
                notices.text("my_key.passphrase_required", &[]),
            ));
        }

        let key = derive_key(passphrase);
        PreferenceRepository::set_my_key(pool, &key).await?;
        tracing::info!("Stored my key {}", key_fingerprint(&key));

        Ok(MyKeyView { key: Some(key) })
    }

    pub async fn generate(pool: &SqlitePool) -> AppResult<GeneratedKey> {
        let passphrase = generate_passphrase();
        let key = derive_key(&passphrase);
        PreferenceRepository::set_my_key(pool, &key).await?;
        tracing::info!("Generated my key {}", key_fingerprint(&key));

        Ok(GeneratedKey { passphrase, key })
    }
}
