use sqlx::SqlitePool;

use crate::db::models::{Preference, GENERATED_KEY, LOCATION_SHARING_PREFS};
use crate::error::{AppError, AppResult};
use crate::services::keys::DerivedKey;

// ============================================================================
// Preference Repository
// ============================================================================

pub struct PreferenceRepository;

impl PreferenceRepository {
    pub async fn get(pool: &SqlitePool, namespace: &str, key: &str) -> AppResult<Option<Preference>> {
        sqlx::query_as::<_, Preference>(
            r#"
            SELECT namespace, key, value, updated_at
            FROM preferences
            WHERE namespace = ? AND key = ?
            LIMIT 1
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Insert or overwrite a preference value.
    pub async fn set(
        pool: &SqlitePool,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> AppResult<Preference> {
        let now = chrono::Utc::now().naive_utc();

        sqlx::query_as::<_, Preference>(
            r#"
            INSERT INTO preferences (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            RETURNING namespace, key, value, updated_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// "My generated key". A stored value that is not a well-formed derived
    /// key is treated as absent.
    pub async fn my_key(pool: &SqlitePool) -> AppResult<Option<DerivedKey>> {
        let pref = Self::get(pool, LOCATION_SHARING_PREFS, GENERATED_KEY).await?;

        Ok(pref.and_then(|p| match DerivedKey::parse(&p.value) {
            Ok(key) => Some(key),
            Err(_) => {
                tracing::warn!("Ignoring malformed stored key in {}", LOCATION_SHARING_PREFS);
                None
            }
        }))
    }

    pub async fn set_my_key(pool: &SqlitePool, key: &DerivedKey) -> AppResult<Preference> {
        Self::set(pool, LOCATION_SHARING_PREFS, GENERATED_KEY, key.as_str()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::keys::derive_key;

    pub(crate) async fn memory_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn set_then_get_and_overwrite() {
        let pool = memory_pool().await;

        assert!(PreferenceRepository::get(&pool, "ns", "k").await.unwrap().is_none());

        PreferenceRepository::set(&pool, "ns", "k", "one").await.unwrap();
        let updated = PreferenceRepository::set(&pool, "ns", "k", "two").await.unwrap();
        assert_eq!(updated.value, "two");

        let fetched = PreferenceRepository::get(&pool, "ns", "k").await.unwrap().unwrap();
        assert_eq!(fetched.value, "two");
        assert!(PreferenceRepository::get(&pool, "other", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn my_key_round_trip() {
        let pool = memory_pool().await;
        assert!(PreferenceRepository::my_key(&pool).await.unwrap().is_none());

        let key = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &key).await.unwrap();
        assert_eq!(PreferenceRepository::my_key(&pool).await.unwrap(), Some(key));
    }

    #[tokio::test]
    async fn malformed_stored_key_reads_as_absent() {
        let pool = memory_pool().await;
        PreferenceRepository::set(&pool, LOCATION_SHARING_PREFS, GENERATED_KEY, "plaintext")
            .await
            .unwrap();

        assert!(PreferenceRepository::my_key(&pool).await.unwrap().is_none());
    }
}
