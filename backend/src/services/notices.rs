use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::i18n;

/// Oldest notices are dropped beyond this many undelivered entries.
pub const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A transient, already-localized message for the shell to show once.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub id: Uuid,
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Queue of user-visible notices. Failures in fire-and-forget paths end up
/// here instead of propagating to a caller.
#[derive(Clone)]
pub struct NoticeBoard {
    lang: Arc<str>,
    queue: Arc<Mutex<VecDeque<Notice>>>,
}

impl NoticeBoard {
    pub fn new(lang: &str) -> Self {
        Self {
            lang: Arc::from(lang),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Translate `key` in the board's language.
    pub fn text(&self, key: &str, params: &[(&str, &str)]) -> String {
        i18n::tr(Some(&*self.lang), key, Some(params))
    }

    pub fn info(&self, key: &str, params: &[(&str, &str)]) -> Notice {
        self.push(NoticeLevel::Info, self.text(key, params))
    }

    pub fn error(&self, key: &str, params: &[(&str, &str)]) -> Notice {
        self.push(NoticeLevel::Error, self.text(key, params))
    }

    pub fn push(&self, level: NoticeLevel, message: String) -> Notice {
        let notice = Notice {
            id: Uuid::new_v4(),
            level,
            message,
            created_at: Utc::now(),
        };

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() == NOTICE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(notice.clone());

        notice
    }

    /// Take every pending notice, oldest first.
    pub fn drain(&self) -> Vec<Notice> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_are_localized_and_drained_in_order() {
        let board = NoticeBoard::new("ko");
        board.info("tracking.started", &[]);
        board.error("backend.write_failed", &[("err", "offline")]);

        let notices = board.drain();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].message, "추적 시작");
        assert_eq!(notices[0].level, NoticeLevel::Info);
        assert_eq!(notices[1].message, "서버 저장 실패: offline");
        assert_eq!(notices[1].level, NoticeLevel::Error);

        assert!(board.is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let board = NoticeBoard::new("en");
        for i in 0..NOTICE_CAPACITY + 3 {
            board.push(NoticeLevel::Info, format!("n{}", i));
        }
        let notices = board.drain();
        assert_eq!(notices.len(), NOTICE_CAPACITY);
        assert_eq!(notices[0].message, "n3");
    }

    #[test]
    fn clones_share_the_queue() {
        let board = NoticeBoard::new("en");
        let other = board.clone();
        other.info("tracking.stopped", &[]);
        assert_eq!(board.len(), 1);
        assert_eq!(board.drain()[0].message, "Tracking stopped");
    }
}
