//! Location tracking session.
//!
//! A session is either idle or tracking one partner record. Tracking owns
//! exactly one live subscription; every exit path (explicit stop, lifecycle
//! teardown, shutdown) goes through [`LocationSession::teardown`], which
//! clears the watcher flag, closes the subscription and forgets the last
//! known location.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{AppError, AppResult};
use crate::services::keys::{derive_key, key_fingerprint, DerivedKey};
use crate::services::notices::NoticeBoard;
use crate::services::realtime::{location_path, watcher_path, Coordinates, RealtimeStore};
use crate::services::writes::{WriteOp, WriteQueue};

/// Last known partner location, tagged with the subscription generation that
/// produced it so a late update from a closed subscription is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationFeed {
    pub generation: u64,
    pub location: Option<Coordinates>,
    /// The backend ended this generation's subscription.
    pub lost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    Idle,
    /// Tracking, but no valid location has arrived yet.
    Waiting,
    Located,
    /// The backend cancelled the subscription. Stop and start again to resume.
    Lost,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub tracking: bool,
    pub partner_key: Option<DerivedKey>,
    pub location: Option<Coordinates>,
    pub status: TrackingStatus,
}

impl SessionView {
    pub fn idle() -> Self {
        Self {
            tracking: false,
            partner_key: None,
            location: None,
            status: TrackingStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    Lifecycle,
    Shutdown,
}

/// Handle for one live subscription to a partner's location record.
/// Dropping it cancels the listener task.
pub struct LocationSubscription {
    key: DerivedKey,
    task: JoinHandle<()>,
}

impl LocationSubscription {
    async fn open(
        store: &Arc<dyn RealtimeStore>,
        key: &DerivedKey,
        generation: u64,
        feed: Arc<watch::Sender<LocationFeed>>,
        notices: NoticeBoard,
    ) -> AppResult<Self> {
        let mut stream = store.subscribe(&location_path(key)).await?;
        let fingerprint = key_fingerprint(key).to_string();

        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        let location = value.as_ref().and_then(Coordinates::from_record);
                        feed.send_if_modified(|current| {
                            if current.generation != generation || current.location == location {
                                return false;
                            }
                            current.location = location;
                            true
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Location subscription for {} failed: {}", fingerprint, e);
                        mark_lost(&feed, generation, &notices);
                        return;
                    }
                }
            }

            tracing::info!("Location subscription for {} was cancelled by the backend", fingerprint);
            mark_lost(&feed, generation, &notices);
        });

        Ok(Self {
            key: key.clone(),
            task,
        })
    }

    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    /// Cancel the listener and wait until it is gone.
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

fn mark_lost(feed: &watch::Sender<LocationFeed>, generation: u64, notices: &NoticeBoard) {
    let marked = feed.send_if_modified(|current| {
        if current.generation != generation {
            return false;
        }
        current.location = None;
        current.lost = true;
        true
    });
    if marked {
        notices.error("tracking.subscription_lost", &[]);
    }
}

impl Drop for LocationSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum SessionState {
    Idle,
    Tracking {
        key: DerivedKey,
        subscription: LocationSubscription,
    },
}

pub struct LocationSession {
    realtime: Arc<dyn RealtimeStore>,
    writes: WriteQueue,
    notices: NoticeBoard,
    await_writes: bool,
    state: Mutex<SessionState>,
    feed: Arc<watch::Sender<LocationFeed>>,
    closed: AtomicBool,
}

impl LocationSession {
    pub fn new(realtime: Arc<dyn RealtimeStore>, notices: NoticeBoard, await_writes: bool) -> Self {
        let writes = WriteQueue::spawn(realtime.clone(), notices.clone());
        let (feed, _) = watch::channel(LocationFeed::default());

        Self {
            realtime,
            writes,
            notices,
            await_writes,
            state: Mutex::new(SessionState::Idle),
            feed: Arc::new(feed),
            closed: AtomicBool::new(false),
        }
    }

    /// Begin observing the record addressed by `passphrase`.
    ///
    /// Raises the watcher flag and opens the subscription. Refuses an empty
    /// passphrase, a second start while tracking and any start once the
    /// owning screen has closed.
    pub async fn start(&self, passphrase: &str) -> AppResult<SessionView> {
        if passphrase.is_empty() {
            return Err(AppError::Validation(
                self.notices.text("tracking.passphrase_required", &[]),
            ));
        }

        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable(
                self.notices.text("tracking.screen_closed", &[]),
            ));
        }
        if matches!(*state, SessionState::Tracking { .. }) {
            return Err(AppError::Conflict(
                self.notices.text("tracking.already_active", &[]),
            ));
        }

        let key = derive_key(passphrase);
        tracing::info!("Starting location tracking for {}", key_fingerprint(&key));

        let watcher_on = WriteOp::Set {
            path: watcher_path(&key),
            value: json!(true),
        };
        if self.await_writes {
            self.writes.submit_and_wait(watcher_on).await?;
        } else {
            self.writes.submit(watcher_on);
        }

        let generation = self.next_generation();
        let subscription = match LocationSubscription::open(
            &self.realtime,
            &key,
            generation,
            self.feed.clone(),
            self.notices.clone(),
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(
                    "Failed to subscribe to {}: {}; lowering watcher flag",
                    key_fingerprint(&key),
                    e
                );
                self.writes.submit(WriteOp::Set {
                    path: watcher_path(&key),
                    value: json!(false),
                });
                return Err(e);
            }
        };

        *state = SessionState::Tracking {
            key: key.clone(),
            subscription,
        };
        drop(state);

        self.notices.info("tracking.started", &[]);
        Ok(self.view().await)
    }

    /// Refuse further starts. A start already holding the state lock finishes
    /// first, so a teardown after this call always sees it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// User-initiated stop. Returns false if nothing was being tracked.
    pub async fn stop(&self) -> bool {
        self.teardown(StopReason::User).await
    }

    /// Leave the tracking state through any exit path. Idempotent: a second
    /// call finds the session idle and does nothing.
    pub async fn teardown(&self, reason: StopReason) -> bool {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, SessionState::Idle);
        let SessionState::Tracking { key, subscription } = previous else {
            return false;
        };

        tracing::info!(
            "Stopping location tracking for {} ({:?})",
            key_fingerprint(&key),
            reason
        );

        let watcher_off = WriteOp::Set {
            path: watcher_path(&key),
            value: json!(false),
        };
        let write_result = if self.await_writes {
            self.writes.submit_and_wait(watcher_off).await
        } else {
            self.writes.submit(watcher_off);
            Ok(())
        };

        subscription.close().await;
        self.next_generation();
        drop(state);

        if let Err(e) = write_result {
            // Left with a stale watcher=true; nothing reconciles it.
            tracing::warn!("Failed to lower watcher flag for {}: {}", key_fingerprint(&key), e);
            self.notices.error("backend.write_failed", &[("err", &e.to_string())]);
        }

        match reason {
            StopReason::User => {
                self.notices.info("tracking.stopped", &[]);
            }
            StopReason::Lifecycle => {
                self.notices.info("tracking.auto_stopped", &[]);
            }
            StopReason::Shutdown => {}
        }

        true
    }

    pub async fn is_tracking(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Tracking { .. })
    }

    pub async fn view(&self) -> SessionView {
        let state = self.state.lock().await;
        let feed = *self.feed.borrow();

        match &*state {
            SessionState::Idle => SessionView::idle(),
            SessionState::Tracking { key, subscription } => {
                debug_assert_eq!(key, subscription.key());
                let status = if feed.lost {
                    TrackingStatus::Lost
                } else if feed.location.is_some() {
                    TrackingStatus::Located
                } else {
                    TrackingStatus::Waiting
                };
                SessionView {
                    tracking: true,
                    partner_key: Some(key.clone()),
                    location: feed.location,
                    status,
                }
            }
        }
    }

    #[cfg(test)]
    pub fn watch_location(&self) -> watch::Receiver<LocationFeed> {
        self.feed.subscribe()
    }

    /// Wait for every watcher write issued so far to be attempted.
    pub async fn flush(&self) {
        self.writes.flush().await;
    }

    /// Invalidate the current subscription's updates and clear the location.
    fn next_generation(&self) -> u64 {
        let mut generation = 0;
        self.feed.send_modify(|feed| {
            feed.generation += 1;
            feed.location = None;
            feed.lost = false;
            generation = feed.generation;
        });
        generation
    }
}
