//! Firebase adapters over REST: Realtime Database for location records and
//! Cloud Firestore for shared schedules.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::FirebaseConfig;
use crate::error::{AppError, AppResult};
use crate::services::documents::{DocumentStore, FieldValue, Fields, StoredDocument};
use crate::services::realtime::{write_at, RealtimeStore, ValueStream};

const FIRESTORE_API_URL: &str = "https://firestore.googleapis.com/v1";
const LIST_PAGE_SIZE: u32 = 300;

async fn check_status(response: Response, what: &str) -> AppResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    Err(AppError::Backend(format!(
        "Failed to {} ({}): {}",
        what, status, error_text
    )))
}

// ============================================================================
// Realtime Database
// ============================================================================

#[derive(Debug, Clone)]
pub struct FirebaseRealtimeStore {
    client: Client,
    /// Separate client without a total timeout for long-lived event streams.
    stream_client: Client,
    database_url: String,
    auth_token: Option<String>,
}

impl FirebaseRealtimeStore {
    pub fn new(config: &FirebaseConfig) -> AppResult<Self> {
        let database_url = config
            .database_url
            .clone()
            .ok_or_else(|| AppError::Config("FIREBASE_DATABASE_URL is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            stream_client,
            database_url: database_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.database_url, path.trim_matches('/'))
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.query(&[("auth", token.as_str())]),
            None => request,
        }
    }
}

#[async_trait]
impl RealtimeStore for FirebaseRealtimeStore {
    async fn set(&self, path: &str, value: Value) -> AppResult<()> {
        let response = self
            .with_auth(self.client.put(self.url(path)).json(&value))
            .send()
            .await?;
        check_status(response, "write real-time value").await?;
        Ok(())
    }

    async fn update(&self, path: &str, children: Map<String, Value>) -> AppResult<()> {
        let response = self
            .with_auth(self.client.patch(self.url(path)).json(&children))
            .send()
            .await?;
        check_status(response, "update real-time value").await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> AppResult<Option<Value>> {
        let response = self.with_auth(self.client.get(self.url(path))).send().await?;
        let value: Value = check_status(response, "read real-time value")
            .await?
            .json()
            .await?;
        Ok(non_empty(value))
    }

    async fn subscribe(&self, path: &str) -> AppResult<ValueStream> {
        let response = self
            .with_auth(
                self.stream_client
                    .get(self.url(path))
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .send()
            .await?;
        let response = check_status(response, "open real-time subscription").await?;

        tracing::debug!("Opened event stream for {}", path);

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let state = EventStreamState {
            bytes,
            parser: SseParser::default(),
            pending: Vec::new(),
            snapshot: Value::Null,
            finished: false,
        };

        Ok(futures::stream::unfold(state, next_value).boxed())
    }
}

/// Empty objects and nulls mean "nothing stored".
fn non_empty(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(ref map) if map.is_empty() => None,
        other => Some(other),
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines and
/// multi-byte characters anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Map<String, Value> },
    KeepAlive,
    Cancel(String),
    AuthRevoked,
}

#[derive(Deserialize)]
struct EventPayload<T> {
    path: String,
    data: T,
}

pub fn parse_event(event: &SseEvent) -> AppResult<Option<RealtimeEvent>> {
    let invalid = |e: serde_json::Error| {
        AppError::Backend(format!("Malformed {} event: {}", event.event, e))
    };

    let parsed = match event.event.as_str() {
        "put" => {
            let payload: EventPayload<Value> = serde_json::from_str(&event.data).map_err(invalid)?;
            RealtimeEvent::Put {
                path: payload.path,
                data: payload.data,
            }
        }
        "patch" => {
            let payload: EventPayload<Map<String, Value>> =
                serde_json::from_str(&event.data).map_err(invalid)?;
            RealtimeEvent::Patch {
                path: payload.path,
                data: payload.data,
            }
        }
        "keep-alive" => RealtimeEvent::KeepAlive,
        "cancel" => RealtimeEvent::Cancel(event.data.clone()),
        "auth_revoked" => RealtimeEvent::AuthRevoked,
        other => {
            tracing::debug!("Ignoring unknown event type {:?}", other);
            return Ok(None);
        }
    };

    Ok(Some(parsed))
}

/// Apply a data event to the local copy of the subscribed value. Returns
/// false for events that carry no data.
pub fn apply_event(snapshot: &mut Value, event: RealtimeEvent) -> bool {
    match event {
        RealtimeEvent::Put { path, data } => {
            write_at(snapshot, &path, data);
            true
        }
        RealtimeEvent::Patch { path, data } => {
            for (child, value) in data {
                write_at(snapshot, &format!("{}/{}", path.trim_end_matches('/'), child), value);
            }
            true
        }
        _ => false,
    }
}

struct EventStreamState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseParser,
    pending: Vec<SseEvent>,
    snapshot: Value,
    finished: bool,
}

async fn next_value(
    mut state: EventStreamState,
) -> Option<(AppResult<Option<Value>>, EventStreamState)> {
    if state.finished {
        return None;
    }

    loop {
        while !state.pending.is_empty() {
            let event = state.pending.remove(0);
            match parse_event(&event) {
                Ok(Some(RealtimeEvent::Cancel(reason))) => {
                    state.finished = true;
                    return Some((
                        Err(AppError::Backend(format!("Subscription cancelled: {}", reason))),
                        state,
                    ));
                }
                Ok(Some(RealtimeEvent::AuthRevoked)) => {
                    state.finished = true;
                    return Some((
                        Err(AppError::Backend("Subscription credentials revoked".to_string())),
                        state,
                    ));
                }
                Ok(Some(event)) => {
                    if apply_event(&mut state.snapshot, event) {
                        let value = non_empty(state.snapshot.clone());
                        return Some((Ok(value), state));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // A garbled event is skipped; the next put resynchronizes.
                    tracing::warn!("{}", e);
                }
            }
        }

        match state.bytes.next().await {
            Some(Ok(chunk)) => {
                let events = state.parser.feed(&chunk);
                state.pending.extend(events);
            }
            Some(Err(e)) => {
                state.finished = true;
                return Some((Err(AppError::Request(e)), state));
            }
            None => return None,
        }
    }
}

// ============================================================================
// Firestore
// ============================================================================

#[derive(Debug, Clone)]
pub struct FirestoreDocumentStore {
    client: Client,
    project_id: String,
    api_key: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl FirestoreDocumentStore {
    pub fn new(config: &FirebaseConfig) -> AppResult<Self> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| AppError::Config("FIREBASE_PROJECT_ID is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            project_id,
            api_key: config.api_key.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    /// Resource name prefix of every document in the default database.
    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/(default)/documents",
            self.project_id
        )
    }

    fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        request
    }
}

/// Build a commit that creates the document, letting the server stamp every
/// `ServerTimestamp` field with its request time.
pub fn commit_body(document_name: &str, fields: &Fields) -> Value {
    let mut encoded = Map::new();
    let mut transforms = Vec::new();

    for (name, value) in fields {
        match value {
            FieldValue::String(s) => {
                encoded.insert(name.clone(), json!({ "stringValue": s }));
            }
            FieldValue::Timestamp(ts) => {
                encoded.insert(name.clone(), json!({ "timestampValue": ts.to_rfc3339() }));
            }
            FieldValue::ServerTimestamp => {
                transforms.push(json!({
                    "fieldPath": name,
                    "setToServerValue": "REQUEST_TIME",
                }));
            }
        }
    }

    json!({
        "writes": [{
            "update": { "name": document_name, "fields": encoded },
            "updateTransforms": transforms,
            "currentDocument": { "exists": false },
        }]
    })
}

/// Decode Firestore typed values. Types other than strings and timestamps
/// are not used by this service and are skipped.
pub fn decode_fields(raw: &Map<String, Value>) -> Fields {
    raw.iter()
        .filter_map(|(name, value)| {
            if let Some(s) = value.get("stringValue").and_then(Value::as_str) {
                return Some((name.clone(), FieldValue::String(s.to_string())));
            }
            let ts = value.get("timestampValue").and_then(Value::as_str)?;
            let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            Some((name.clone(), FieldValue::Timestamp(ts)))
        })
        .collect()
}

fn document_id(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    async fn add(&self, collection: &str, fields: Fields) -> AppResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("{}/{}/{}", self.documents_root(), collection.trim_matches('/'), id);
        let url = format!(
            "{}/projects/{}/databases/(default)/documents:commit",
            FIRESTORE_API_URL, self.project_id
        );

        let response = self
            .authorize(self.client.post(url).json(&commit_body(&name, &fields)))
            .send()
            .await?;
        check_status(response, "commit document").await?;

        Ok(id)
    }

    async fn list(&self, collection: &str) -> AppResult<Vec<StoredDocument>> {
        let url = format!(
            "{}/{}/{}",
            FIRESTORE_API_URL,
            self.documents_root(),
            collection.trim_matches('/')
        );

        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("pageSize", LIST_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = self.authorize(request).send().await?;
            let page: ListDocumentsResponse = check_status(response, "list documents")
                .await?
                .json()
                .await?;

            documents.extend(page.documents.into_iter().map(|doc| StoredDocument {
                id: document_id(&doc.name),
                fields: decode_fields(&doc.fields),
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }
}
