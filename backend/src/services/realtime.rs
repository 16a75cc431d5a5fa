//! Real-time key-value store abstraction.
//!
//! Models the subset of a hosted real-time database the location sharing
//! protocol needs: set / partial update / read of a JSON tree addressed by
//! slash-separated paths, plus a live value subscription that yields the
//! full value at the subscribed path on every change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};

use crate::error::{AppError, AppResult};
use crate::services::keys::DerivedKey;

/// Root node holding one record per derived key.
pub const LOCATIONS_ROOT: &str = "shared_locations";

/// Successive values at a subscribed path. `None` means nothing is stored there.
/// The stream ends when the backend cancels the subscription.
pub type ValueStream = BoxStream<'static, AppResult<Option<Value>>>;

#[async_trait]
pub trait RealtimeStore: Send + Sync + 'static {
    /// Replace the value at `path`. `Value::Null` removes it.
    async fn set(&self, path: &str, value: Value) -> AppResult<()>;

    /// Write the given children under `path`, leaving siblings untouched.
    async fn update(&self, path: &str, children: Map<String, Value>) -> AppResult<()>;

    async fn get(&self, path: &str) -> AppResult<Option<Value>>;

    /// Open a live subscription. The first item is the current value.
    async fn subscribe(&self, path: &str) -> AppResult<ValueStream>;
}

pub fn location_path(key: &DerivedKey) -> String {
    format!("{}/{}", LOCATIONS_ROOT, key)
}

pub fn watcher_path(key: &DerivedKey) -> String {
    format!("{}/{}/watcher", LOCATIONS_ROOT, key)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Extract a position from a location record. Both fields must be present
    /// and numeric, otherwise the record carries no location.
    pub fn from_record(record: &Value) -> Option<Self> {
        let lat = record.get("lat")?.as_f64()?;
        let lon = record.get("lon")?.as_f64()?;
        Some(Self { lat, lon })
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Read the watcher flag of a location record. Anything but `true` is "not watched".
pub fn watcher_from_record(record: &Value) -> bool {
    record
        .get("watcher")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// True when a change at `changed` can affect the value at `subscribed`.
fn paths_overlap(changed: &str, subscribed: &str) -> bool {
    let a = segments(changed);
    let b = segments(subscribed);
    let common = a.len().min(b.len());
    a[..common] == b[..common]
}

fn read_at(root: &Value, path: &str) -> Option<Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.get(seg)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node.clone())
    }
}

pub(crate) fn write_at(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };

    if value.is_null() {
        // Removing under an absent parent leaves the tree untouched.
        let mut node = root;
        for seg in parents {
            match node.get_mut(*seg) {
                Some(child) => node = child,
                None => return,
            }
        }
        if let Some(obj) = node.as_object_mut() {
            obj.remove(*last);
        }
        return;
    }

    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        // `node` was just made an object
        let Some(obj) = node.as_object_mut() else {
            return;
        };
        node = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(obj) = node.as_object_mut() {
        obj.insert(last.to_string(), value);
    }
}

struct MemoryInner {
    root: RwLock<Value>,
    changes: broadcast::Sender<String>,
    offline: AtomicBool,
}

/// Process-local real-time store. Every write broadcasts the changed path
/// and subscribers re-read their own path when it overlaps.
#[derive(Clone)]
pub struct MemoryRealtimeStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryRealtimeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRealtimeStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MemoryInner {
                root: RwLock::new(Value::Object(Map::new())),
                changes,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Simulate loss of connectivity: writes and new subscriptions fail.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live subscriptions across all paths.
    pub fn listener_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn ensure_online(&self) -> AppResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(AppError::Backend("real-time store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn notify(&self, path: &str) {
        // No receivers is fine: nobody is listening.
        let _ = self.inner.changes.send(path.to_string());
    }
}

struct Listener {
    path: String,
    initial: bool,
    rx: broadcast::Receiver<String>,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl RealtimeStore for MemoryRealtimeStore {
    async fn set(&self, path: &str, value: Value) -> AppResult<()> {
        self.ensure_online()?;
        write_at(&mut *self.inner.root.write().await, path, value);
        self.notify(path);
        Ok(())
    }

    async fn update(&self, path: &str, children: Map<String, Value>) -> AppResult<()> {
        self.ensure_online()?;
        {
            let mut root = self.inner.root.write().await;
            for (child, value) in children {
                write_at(&mut root, &format!("{}/{}", path, child), value);
            }
        }
        self.notify(path);
        Ok(())
    }

    async fn get(&self, path: &str) -> AppResult<Option<Value>> {
        self.ensure_online()?;
        Ok(read_at(&*self.inner.root.read().await, path))
    }

    async fn subscribe(&self, path: &str) -> AppResult<ValueStream> {
        self.ensure_online()?;

        // Subscribe before the initial read so no change slips in between.
        let listener = Listener {
            path: path.to_string(),
            initial: true,
            rx: self.inner.changes.subscribe(),
            inner: self.inner.clone(),
        };

        let stream = futures::stream::unfold(listener, |mut l| async move {
            if l.initial {
                l.initial = false;
                let value = read_at(&*l.inner.root.read().await, &l.path);
                return Some((Ok(value), l));
            }

            loop {
                match l.rx.recv().await {
                    Ok(changed) => {
                        if paths_overlap(&changed, &l.path) {
                            let value = read_at(&*l.inner.root.read().await, &l.path);
                            return Some((Ok(value), l));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "Listener on {} lagged by {} changes; re-reading",
                            l.path,
                            skipped
                        );
                        let value = read_at(&*l.inner.root.read().await, &l.path);
                        return Some((Ok(value), l));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
