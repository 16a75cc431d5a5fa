//! Schedule sharing: validate a draft, append it to the partner's collection,
//! and list what others have sent to me.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::PreferenceRepository;
use crate::error::{AppError, AppErrorWithDetails, AppResult};
use crate::services::documents::{DocumentStore, FieldValue, Fields, StoredDocument};
use crate::services::keys::{derive_key, key_fingerprint, DerivedKey};
use crate::services::notices::NoticeBoard;

pub const SCHEDULES_ROOT: &str = "shared_schedules";

lazy_static! {
    static ref TIME_RE: Regex = Regex::new(r"^([01][0-9]|2[0-3]):[0-5][0-9]$").unwrap();
}

pub fn items_collection(key: &DerivedKey) -> String {
    format!("{}/{}/items", SCHEDULES_ROOT, key)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleDraft {
    pub partner_code: String,
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: String,
}

/// Why a draft was refused. Checked in declaration order; the first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRejection {
    MissingPartner,
    EmptyTitle,
    MissingDate,
    InvalidDate,
    InvalidTime,
    PastDateTime,
}

impl ScheduleRejection {
    pub fn code(self) -> &'static str {
        match self {
            ScheduleRejection::MissingPartner => "missing_partner",
            ScheduleRejection::EmptyTitle => "empty_title",
            ScheduleRejection::MissingDate => "missing_date",
            ScheduleRejection::InvalidDate => "invalid_date",
            ScheduleRejection::InvalidTime => "invalid_time",
            ScheduleRejection::PastDateTime => "past_date_time",
        }
    }

    pub fn message_key(self) -> String {
        format!("schedule.{}", self.code())
    }

    pub fn into_error(self, notices: &NoticeBoard) -> AppErrorWithDetails {
        AppError::Validation(notices.text(&self.message_key(), &[]))
            .with_details(serde_json::json!({ "reason": self.code() }))
    }
}

pub fn is_valid_time(time: &str) -> bool {
    TIME_RE.is_match(time)
}

/// Check a draft against `now` (local wall clock). Returns the moment the
/// schedule refers to, with an empty time meaning midnight.
pub fn validate(draft: &ScheduleDraft, now: NaiveDateTime) -> Result<NaiveDateTime, ScheduleRejection> {
    if draft.partner_code.is_empty() {
        return Err(ScheduleRejection::MissingPartner);
    }
    if draft.title.is_empty() {
        return Err(ScheduleRejection::EmptyTitle);
    }

    let date = match draft.date.as_deref() {
        None | Some("") => return Err(ScheduleRejection::MissingDate),
        Some(raw) => parse_date(raw).ok_or(ScheduleRejection::InvalidDate)?,
    };

    let time = if draft.time.is_empty() {
        NaiveTime::default()
    } else if is_valid_time(&draft.time) {
        NaiveTime::parse_from_str(&draft.time, "%H:%M").map_err(|_| ScheduleRejection::InvalidTime)?
    } else {
        return Err(ScheduleRejection::InvalidTime);
    };

    let at = date.and_time(time);
    if at < now {
        return Err(ScheduleRejection::PastDateTime);
    }

    Ok(at)
}

/// Strict `YYYY-MM-DD`.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSchedule {
    pub id: String,
    pub title: String,
    pub date: String,
    pub time: String,
    pub created_at: Option<DateTime<Utc>>,
    pub sender_key: String,
}

impl SharedSchedule {
    fn from_document(doc: StoredDocument) -> Self {
        let text = |name: &str| {
            doc.fields
                .get(name)
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            title: text("title"),
            date: text("date"),
            time: text("time"),
            sender_key: text("senderKey"),
            created_at: doc.fields.get("createdAt").and_then(FieldValue::as_timestamp),
            id: doc.id,
        }
    }
}

fn schedule_fields(draft: &ScheduleDraft, sender_key: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("title".to_string(), FieldValue::String(draft.title.clone()));
    fields.insert(
        "date".to_string(),
        FieldValue::String(draft.date.clone().unwrap_or_default()),
    );
    fields.insert("time".to_string(), FieldValue::String(draft.time.clone()));
    fields.insert("createdAt".to_string(), FieldValue::ServerTimestamp);
    fields.insert("senderKey".to_string(), FieldValue::String(sender_key.to_string()));
    fields
}

#[derive(Debug, Clone, Serialize)]
pub struct SentSchedule {
    pub id: String,
    pub message: String,
}

/// Clears the sending flag when the send finishes, whichever way it ends.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ScheduleService {
    documents: Arc<dyn DocumentStore>,
    db: SqlitePool,
    notices: NoticeBoard,
    sending: AtomicBool,
}

impl ScheduleService {
    pub fn new(documents: Arc<dyn DocumentStore>, db: SqlitePool, notices: NoticeBoard) -> Self {
        Self {
            documents,
            db,
            notices,
            sending: AtomicBool::new(false),
        }
    }

    /// True while a send is in flight.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    pub async fn send(&self, draft: ScheduleDraft) -> Result<SentSchedule, AppErrorWithDetails> {
        self.send_at(draft, Local::now().naive_local()).await
    }

    async fn send_at(
        &self,
        draft: ScheduleDraft,
        now: NaiveDateTime,
    ) -> Result<SentSchedule, AppErrorWithDetails> {
        if let Err(reason) = validate(&draft, now) {
            tracing::debug!("Schedule rejected: {}", reason.code());
            return Err(reason.into_error(&self.notices));
        }

        if self
            .sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Conflict(self.notices.text("schedule.already_sending", &[])).into());
        }
        let _guard = SendingGuard(&self.sending);

        let sender_key = PreferenceRepository::my_key(&self.db)
            .await?
            .map(String::from)
            .unwrap_or_default();

        let partner = derive_key(&draft.partner_code);
        let fields = schedule_fields(&draft, &sender_key);

        match self.documents.add(&items_collection(&partner), fields).await {
            Ok(id) => {
                tracing::info!("Schedule {} shared with {}", id, key_fingerprint(&partner));
                let notice = self.notices.info("schedule.sent", &[]);
                Ok(SentSchedule {
                    id,
                    message: notice.message,
                })
            }
            Err(e) => {
                tracing::warn!("Failed to share schedule with {}: {}", key_fingerprint(&partner), e);
                self.notices
                    .error("schedule.send_failed", &[("err", &e.to_string())]);
                Err(e.into())
            }
        }
    }

    /// Schedules addressed to my key, newest first.
    pub async fn inbox(&self) -> AppResult<Vec<SharedSchedule>> {
        let key = PreferenceRepository::my_key(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(self.notices.text("my_key.not_set", &[])))?;

        let mut items: Vec<SharedSchedule> = self
            .documents
            .list(&items_collection(&key))
            .await?
            .into_iter()
            .map(SharedSchedule::from_document)
            .collect();

        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::preferences::tests::memory_pool;
    use crate::services::documents::MemoryDocumentStore;
    use chrono::Duration;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn draft(date: Option<&str>, time: &str) -> ScheduleDraft {
        ScheduleDraft {
            partner_code: "partner".to_string(),
            title: "dinner".to_string(),
            date: date.map(str::to_string),
            time: time.to_string(),
        }
    }

    async fn service() -> (ScheduleService, MemoryDocumentStore, SqlitePool) {
        let store = MemoryDocumentStore::new();
        let pool = memory_pool().await;
        let service = ScheduleService::new(Arc::new(store.clone()), pool.clone(), NoticeBoard::new("en"));
        (service, store, pool)
    }

    #[test]
    fn far_future_date_without_time_is_accepted() {
        let at = validate(&draft(Some("2099-01-01"), ""), now()).unwrap();
        assert_eq!(at.time(), NaiveTime::default());
    }

    #[test]
    fn yesterday_is_rejected_regardless_of_time() {
        let yesterday = (now() - Duration::days(1)).date().format("%Y-%m-%d").to_string();
        for time in ["", "00:00", "23:59"] {
            assert_eq!(
                validate(&draft(Some(&yesterday), time), now()),
                Err(ScheduleRejection::PastDateTime)
            );
        }
    }

    #[test]
    fn today_depends_on_time() {
        assert_eq!(
            validate(&draft(Some("2025-06-15"), "11:59"), now()),
            Err(ScheduleRejection::PastDateTime)
        );
        assert!(validate(&draft(Some("2025-06-15"), "12:00"), now()).is_ok());
        assert!(validate(&draft(Some("2025-06-15"), "18:30"), now()).is_ok());
        // Empty time means midnight, which has already passed
        assert_eq!(
            validate(&draft(Some("2025-06-15"), ""), now()),
            Err(ScheduleRejection::PastDateTime)
        );
    }

    #[test]
    fn first_failure_wins() {
        let mut d = ScheduleDraft::default();
        assert_eq!(validate(&d, now()), Err(ScheduleRejection::MissingPartner));

        d.partner_code = "p".to_string();
        d.time = "bad".to_string();
        assert_eq!(validate(&d, now()), Err(ScheduleRejection::EmptyTitle));

        d.title = "t".to_string();
        assert_eq!(validate(&d, now()), Err(ScheduleRejection::MissingDate));

        d.date = Some("15/06/2025".to_string());
        assert_eq!(validate(&d, now()), Err(ScheduleRejection::InvalidDate));

        d.date = Some("2099-01-01".to_string());
        assert_eq!(validate(&d, now()), Err(ScheduleRejection::InvalidTime));
    }

    #[test]
    fn dates_must_be_real_and_zero_padded() {
        assert_eq!(
            validate(&draft(Some("2099-02-30"), ""), now()),
            Err(ScheduleRejection::InvalidDate)
        );
        assert_eq!(
            validate(&draft(Some("2099-1-1"), ""), now()),
            Err(ScheduleRejection::InvalidDate)
        );
    }

    #[test]
    fn time_format() {
        for ok in ["00:00", "09:05", "19:59", "23:59"] {
            assert!(is_valid_time(ok), "{}", ok);
        }
        for bad in ["24:00", "9:05", "12:60", "12:5", "1230", " 12:30", "12:30 "] {
            assert!(!is_valid_time(bad), "{}", bad);
        }
    }

    #[tokio::test]
    async fn send_writes_under_the_derived_partner_key() {
        let (service, store, pool) = service().await;
        let mine = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &mine).await.unwrap();

        let sent = service.send(draft(Some("2099-01-01"), "18:30")).await.unwrap();
        assert_eq!(sent.message, "✅ Schedule shared!");

        let docs = store.list(&items_collection(&derive_key("partner"))).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, sent.id);

        let fields = &docs[0].fields;
        assert_eq!(fields["title"].as_str(), Some("dinner"));
        assert_eq!(fields["date"].as_str(), Some("2099-01-01"));
        assert_eq!(fields["time"].as_str(), Some("18:30"));
        assert_eq!(fields["senderKey"].as_str(), Some(mine.as_str()));
        assert!(fields["createdAt"].as_timestamp().is_some());
        assert!(!service.is_sending());
    }

    #[tokio::test]
    async fn sender_key_is_empty_without_my_key() {
        let (service, store, _) = service().await;

        service.send(draft(Some("2099-01-01"), "")).await.unwrap();

        let docs = store.list(&items_collection(&derive_key("partner"))).await.unwrap();
        assert_eq!(docs[0].fields["senderKey"].as_str(), Some(""));
    }

    #[tokio::test]
    async fn rejected_draft_writes_nothing() {
        let (service, store, _) = service().await;

        let err = service
            .send_at(draft(Some("2025-06-14"), ""), now())
            .await
            .unwrap_err();
        let response = axum::response::IntoResponse::into_response(err);
        assert_eq!(response.status(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(store.count(&items_collection(&derive_key("partner"))).await, 0);
    }

    #[tokio::test]
    async fn backend_failure_becomes_a_notice_and_releases_the_gate() {
        let (service, store, _) = service().await;
        store.set_offline(true);

        assert!(service.send(draft(Some("2099-01-01"), "")).await.is_err());
        assert!(!service.is_sending());

        let notices = service.notices.drain();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.starts_with("❌ Failed to send"));
    }

    #[tokio::test]
    async fn inbox_lists_newest_first() {
        let (service, store, pool) = service().await;
        let mine = derive_key("mine");
        PreferenceRepository::set_my_key(&pool, &mine).await.unwrap();

        let collection = items_collection(&mine);
        for (title, minutes) in [("older", 10), ("newer", 1)] {
            let mut fields = Fields::new();
            fields.insert("title".to_string(), FieldValue::String(title.to_string()));
            fields.insert(
                "createdAt".to_string(),
                FieldValue::Timestamp(Utc::now() - Duration::minutes(minutes)),
            );
            store.add(&collection, fields).await.unwrap();
        }

        let inbox = service.inbox().await.unwrap();
        let titles: Vec<&str> = inbox.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["newer", "older"]);
        assert_eq!(inbox[0].time, "");
    }

    #[tokio::test]
    async fn inbox_requires_my_key() {
        let (service, _, _) = service().await;
        assert!(matches!(service.inbox().await, Err(AppError::NotFound(_))));
    }
}
