//! Foreground/background binding for the location screen.
//!
//! The shell forwards its lifecycle transitions as [`LifecycleEvent`]s. A
//! [`LifecycleBinding`] ties one [`LocationSession`] to that signal: losing
//! the foreground tears tracking down, destroying the screen releases the
//! binding. [`ScreenSlot`] owns the screen currently on display.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::services::notices::NoticeBoard;
use crate::services::realtime::RealtimeStore;
use crate::services::session::{LocationSession, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Create,
    Start,
    Resume,
    Pause,
    Stop,
    Destroy,
}

impl LifecycleEvent {
    /// Transitions that mean the screen is no longer in the foreground.
    pub fn leaves_foreground(self) -> bool {
        matches!(
            self,
            LifecycleEvent::Pause | LifecycleEvent::Stop | LifecycleEvent::Destroy
        )
    }
}

/// Source of lifecycle transitions, fanned out to every bound observer.
#[derive(Clone)]
pub struct LifecycleHost {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleHost {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    /// Deliver an event; returns how many observers received it.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        tracing::debug!("Lifecycle event: {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

/// Lifecycle observer for one session. Dropping it stops observing.
pub struct LifecycleBinding {
    task: JoinHandle<()>,
}

impl LifecycleBinding {
    pub fn bind(host: &LifecycleHost, session: Arc<LocationSession>) -> Self {
        let mut rx = host.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LifecycleEvent::Destroy) => {
                        session.teardown(StopReason::Lifecycle).await;
                        break;
                    }
                    Ok(event) if event.leaves_foreground() => {
                        if session.teardown(StopReason::Lifecycle).await {
                            tracing::info!("Tracking stopped on {:?}", event);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A missed event may have been a pause.
                        tracing::warn!("Lifecycle observer lagged by {} events", skipped);
                        session.teardown(StopReason::Lifecycle).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        session.teardown(StopReason::Lifecycle).await;
                        break;
                    }
                }
            }
            tracing::debug!("Lifecycle binding released");
        });

        Self { task }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop observing and wait for the observer task to finish.
    pub async fn release(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for LifecycleBinding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The location screen: one session and the binding that guards it.
pub struct LocationScreen {
    session: Arc<LocationSession>,
    binding: LifecycleBinding,
}

impl LocationScreen {
    pub fn open(host: &LifecycleHost, session: LocationSession) -> Self {
        let session = Arc::new(session);
        let binding = LifecycleBinding::bind(host, session.clone());
        Self { session, binding }
    }

    pub fn session(&self) -> &Arc<LocationSession> {
        &self.session
    }

    /// Tear the screen down: refuse new starts, leave tracking, flush the
    /// watcher write and drop the lifecycle observer.
    pub async fn close(self, reason: StopReason) {
        self.session.close();
        self.session.teardown(reason).await;
        self.session.flush().await;
        self.binding.release().await;
    }
}

/// Holds the location screen currently on display, opening one on demand.
pub struct ScreenSlot {
    host: LifecycleHost,
    realtime: Arc<dyn RealtimeStore>,
    notices: NoticeBoard,
    await_writes: bool,
    current: Mutex<Option<LocationScreen>>,
}

impl ScreenSlot {
    pub fn new(
        host: LifecycleHost,
        realtime: Arc<dyn RealtimeStore>,
        notices: NoticeBoard,
        await_writes: bool,
    ) -> Self {
        Self {
            host,
            realtime,
            notices,
            await_writes,
            current: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn host(&self) -> &LifecycleHost {
        &self.host
    }

    /// Session of the open screen, opening the screen if needed.
    pub async fn session(&self) -> Arc<LocationSession> {
        let mut current = self.current.lock().await;
        if let Some(screen) = current.as_ref() {
            return screen.session().clone();
        }

        let screen = self.open_screen();
        let session = screen.session().clone();
        *current = Some(screen);
        session
    }

    pub async fn current_session(&self) -> Option<Arc<LocationSession>> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|screen| screen.session().clone())
    }

    /// Forward a transition from the shell. `create` opens the screen and
    /// `destroy` closes it after observers have seen the event.
    pub async fn dispatch(&self, event: LifecycleEvent) -> usize {
        let mut current = self.current.lock().await;

        if event == LifecycleEvent::Create && current.is_none() {
            *current = Some(self.open_screen());
        }

        let delivered = self.host.emit(event);

        if event == LifecycleEvent::Destroy {
            if let Some(screen) = current.take() {
                screen.close(StopReason::Lifecycle).await;
            }
        }

        delivered
    }

    /// Close whatever screen is open. Used on process shutdown.
    pub async fn shutdown(&self) {
        if let Some(screen) = self.current.lock().await.take() {
            screen.close(StopReason::Shutdown).await;
        }
    }

    fn open_screen(&self) -> LocationScreen {
        tracing::debug!("Opening location screen");
        let session = LocationSession::new(
            self.realtime.clone(),
            self.notices.clone(),
            self.await_writes,
        );
        LocationScreen::open(&self.host, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::realtime::MemoryRealtimeStore;
    use crate::services::session::tests::{session_with_store, watcher_flag};
    use serde_json::json;
    use std::time::Duration;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn backgrounding_matches_explicit_stop() {
        let host = LifecycleHost::new();

        // Explicit stop
        let (explicit, explicit_store, _) = session_with_store(false);
        explicit.start("partner").await.unwrap();
        explicit.stop().await;
        explicit.flush().await;

        // Backgrounded
        let (session, store, _) = session_with_store(false);
        let session = Arc::new(session);
        let binding = LifecycleBinding::bind(&host, session.clone());
        session.start("partner").await.unwrap();

        host.emit(LifecycleEvent::Pause);
        eventually(|| {
            let session = session.clone();
            async move { !session.is_tracking().await }
        })
        .await;
        session.flush().await;

        assert_eq!(
            watcher_flag(&store, "partner").await,
            watcher_flag(&explicit_store, "partner").await
        );
        assert_eq!(watcher_flag(&store, "partner").await, Some(json!(false)));
        assert_eq!(store.listener_count(), explicit_store.listener_count());
        assert_eq!(session.view().await.status, explicit.view().await.status);
        assert!(binding.is_active());
    }

    #[tokio::test]
    async fn pause_then_stop_tears_down_once() {
        let host = LifecycleHost::new();
        let (session, store, notices) = session_with_store(false);
        let session = Arc::new(session);
        let _binding = LifecycleBinding::bind(&host, session.clone());

        session.start("partner").await.unwrap();
        notices.drain();

        host.emit(LifecycleEvent::Pause);
        host.emit(LifecycleEvent::Stop);
        host.emit(LifecycleEvent::Resume);

        eventually(|| {
            let session = session.clone();
            async move { !session.is_tracking().await }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.flush().await;

        let stops = notices
            .drain()
            .into_iter()
            .filter(|n| n.message.starts_with("Tracking stopped"))
            .count();
        assert_eq!(stops, 1);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn foreground_events_do_not_stop_tracking() {
        let host = LifecycleHost::new();
        let (session, _, _) = session_with_store(false);
        let session = Arc::new(session);
        let _binding = LifecycleBinding::bind(&host, session.clone());

        session.start("partner").await.unwrap();
        host.emit(LifecycleEvent::Start);
        host.emit(LifecycleEvent::Resume);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.is_tracking().await);
    }

    #[tokio::test]
    async fn destroy_releases_the_binding() {
        let host = LifecycleHost::new();
        let (session, _, _) = session_with_store(false);
        let binding = LifecycleBinding::bind(&host, Arc::new(session));
        assert_eq!(host.observer_count(), 1);

        host.emit(LifecycleEvent::Destroy);
        eventually(|| {
            let active = binding.is_active();
            async move { !active }
        })
        .await;

        assert_eq!(host.observer_count(), 0);
    }

    #[tokio::test]
    async fn slot_opens_on_demand_and_closes_on_destroy() {
        let store = MemoryRealtimeStore::new();
        let slot = ScreenSlot::new(
            LifecycleHost::new(),
            Arc::new(store.clone()),
            NoticeBoard::new("en"),
            false,
        );
        assert!(slot.current_session().await.is_none());

        let session = slot.session().await;
        session.start("partner").await.unwrap();
        assert_eq!(slot.host().observer_count(), 1);
        assert_eq!(store.listener_count(), 1);

        slot.dispatch(LifecycleEvent::Destroy).await;

        assert!(slot.current_session().await.is_none());
        assert_eq!(slot.host().observer_count(), 0);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(
            store
                .get(&crate::services::realtime::watcher_path(
                    &crate::services::keys::derive_key("partner")
                ))
                .await
                .unwrap(),
            Some(json!(false))
        );
    }

    #[tokio::test]
    async fn session_taken_before_destroy_cannot_start() {
        let store = MemoryRealtimeStore::new();
        let slot = ScreenSlot::new(
            LifecycleHost::new(),
            Arc::new(store.clone()),
            NoticeBoard::new("en"),
            false,
        );

        let session = slot.session().await;
        slot.dispatch(LifecycleEvent::Destroy).await;

        assert!(session.start("partner").await.is_err());
        assert!(!session.is_tracking().await);
        session.flush().await;
        drop(session);

        assert!(slot.current_session().await.is_none());
        assert_eq!(watcher_flag(&store, "partner").await, None);
        assert_eq!(store.listener_count(), 0);

        // A fresh screen opens normally.
        slot.session().await.start("partner").await.unwrap();
        assert_eq!(store.listener_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_lowers_the_flag() {
        let store = MemoryRealtimeStore::new();
        let slot = ScreenSlot::new(
            LifecycleHost::new(),
            Arc::new(store.clone()),
            NoticeBoard::new("en"),
            false,
        );

        slot.session().await.start("partner").await.unwrap();
        slot.shutdown().await;

        assert_eq!(watcher_flag(&store, "partner").await, Some(json!(false)));
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn events_deserialize_from_lowercase() {
        let event: LifecycleEvent = serde_json::from_str("\"pause\"").unwrap();
        assert_eq!(event, LifecycleEvent::Pause);
        assert!(event.leaves_foreground());
        assert!(!LifecycleEvent::Resume.leaves_foreground());
    }
}
