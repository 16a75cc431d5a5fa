//! Publishes this device's own position under "my key".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map};
use sqlx::SqlitePool;

use crate::db::PreferenceRepository;
use crate::error::{AppError, AppResult};
use crate::services::keys::{key_fingerprint, DerivedKey};
use crate::services::notices::NoticeBoard;
use crate::services::realtime::{
    location_path, watcher_from_record, Coordinates, RealtimeStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { watched: bool },
    /// Location permission is not granted; nothing was written.
    PermissionDenied,
}

pub struct LocationPublisher {
    realtime: Arc<dyn RealtimeStore>,
    db: SqlitePool,
    notices: NoticeBoard,
    permission: AtomicBool,
}

impl LocationPublisher {
    pub fn new(realtime: Arc<dyn RealtimeStore>, db: SqlitePool, notices: NoticeBoard) -> Self {
        Self {
            realtime,
            db,
            notices,
            permission: AtomicBool::new(false),
        }
    }

    /// Record the shell's current location permission state.
    pub fn set_permission(&self, granted: bool) {
        let previous = self.permission.swap(granted, Ordering::SeqCst);
        if previous != granted {
            tracing::info!("Location permission {}", if granted { "granted" } else { "revoked" });
        }
    }

    pub fn has_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    /// Write `{lat, lon}` under my record without touching `watcher`.
    pub async fn publish(&self, lat: f64, lon: f64) -> AppResult<PublishOutcome> {
        let coords = Coordinates { lat, lon };
        if !coords.is_valid() {
            return Err(AppError::Validation(
                self.notices.text("location.invalid_coordinates", &[]),
            ));
        }

        if !self.has_permission() {
            tracing::debug!("Skipping location publish: permission not granted");
            return Ok(PublishOutcome::PermissionDenied);
        }

        let key = self.my_key().await?;

        let mut children = Map::new();
        children.insert("lat".to_string(), json!(coords.lat));
        children.insert("lon".to_string(), json!(coords.lon));
        self.realtime.update(&location_path(&key), children).await?;

        tracing::debug!("Published location for {}", key_fingerprint(&key));

        let watched = self.watched_for(&key).await?;
        Ok(PublishOutcome::Published { watched })
    }

    /// Whether somebody is currently observing my record.
    pub async fn watched(&self) -> AppResult<bool> {
        let key = self.my_key().await?;
        self.watched_for(&key).await
    }

    async fn watched_for(&self, key: &DerivedKey) -> AppResult<bool> {
        let record = self.realtime.get(&location_path(key)).await?;
        Ok(record.as_ref().map(watcher_from_record).unwrap_or(false))
    }

    async fn my_key(&self) -> AppResult<DerivedKey> {
        PreferenceRepository::my_key(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(self.notices.text("my_key.not_set", &[])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::preferences::tests::memory_pool;
    use crate::services::keys::derive_key;
    use crate::services::realtime::{watcher_path, MemoryRealtimeStore};

    async fn publisher() -> (LocationPublisher, MemoryRealtimeStore, SqlitePool) {
        let store = MemoryRealtimeStore::new();
        let pool = memory_pool().await;
        let publisher =
            LocationPublisher::new(Arc::new(store.clone()), pool.clone(), NoticeBoard::new("en"));
        (publisher, store, pool)
    }

    #[tokio::test]
    async fn publish_requires_my_key() {
        let (publisher, _, _) = publisher().await;
        publisher.set_permission(true);

        assert!(matches!(
            publisher.publish(37.5, 127.0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn publish_writes_coordinates_and_keeps_watcher() {
        let (publisher, store, pool) = publisher().await;
        let key = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &key).await.unwrap();
        store.set(&watcher_path(&key), json!(true)).await.unwrap();
        publisher.set_permission(true);

        let outcome = publisher.publish(37.5, 127.0).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Published { watched: true });
        assert_eq!(
            store.get(&location_path(&key)).await.unwrap(),
            Some(json!({ "lat": 37.5, "lon": 127.0, "watcher": true }))
        );
    }

    #[tokio::test]
    async fn denied_permission_skips_the_write() {
        let (publisher, store, pool) = publisher().await;
        let key = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &key).await.unwrap();

        let outcome = publisher.publish(37.5, 127.0).await.unwrap();

        assert_eq!(outcome, PublishOutcome::PermissionDenied);
        assert_eq!(store.get(&location_path(&key)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn out_of_range_coordinates_are_rejected() {
        let (publisher, _, _) = publisher().await;
        publisher.set_permission(true);

        assert!(matches!(
            publisher.publish(91.0, 0.0).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            publisher.publish(0.0, f64::INFINITY).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn watched_reads_the_flag() {
        let (publisher, store, pool) = publisher().await;
        let key = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &key).await.unwrap();

        assert!(!publisher.watched().await.unwrap());
        store.set(&watcher_path(&key), json!(true)).await.unwrap();
        assert!(publisher.watched().await.unwrap());
    }

    #[test]
    fn outcome_serializes_with_a_tag() {
        let value = serde_json::to_value(PublishOutcome::Published { watched: false }).unwrap();
        assert_eq!(value, json!({ "outcome": "published", "watched": false }));
        let value = serde_json::to_value(PublishOutcome::PermissionDenied).unwrap();
        assert_eq!(value, json!({ "outcome": "permission_denied" }));
    }
}
