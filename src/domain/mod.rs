use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header name (lowercase) to the first value seen for that name.
pub type CapturedHeaders = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: Uuid,
    pub owner_id: String,
    pub token: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub method: String,
    pub path: String,
    pub headers: CapturedHeaders,
    pub raw_body: Vec<u8>,
    pub source_ip: Option<String>,
    pub content_length: i64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub stream_id: Uuid,
    pub method: String,
    pub path: String,
    pub headers: CapturedHeaders,
    pub raw_body: Vec<u8>,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilters {
    pub stream_id: Option<Uuid>,
    pub method: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl EventFilters {
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.stream_id.map_or(true, |id| event.stream_id == id)
            && self.method.as_deref().map_or(true, |m| event.method == m)
            && self.start_date.map_or(true, |start| event.received_at >= start)
            && self.end_date.map_or(true, |end| event.received_at <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "replay_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Error,
    Timeout,
}

impl AttemptStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReplayAttempt {
    pub id: Uuid,
    pub event_id: Uuid,
    pub target_url: String,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub duration_ms: i64,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReplayAttempt {
    pub event_id: Uuid,
    pub target_url: String,
    pub attempt_number: i32,
    pub outcome: ReplayOutcome,
}

/// Result of one outbound attempt, and of a whole replay call (its last attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub status: AttemptStatus,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub target_url: String,
    #[serde(default)]
    pub override_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub override_body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateStreamRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

/// Wire form of an event: the body travels as standard base64.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub method: String,
    pub path: String,
    pub headers: CapturedHeaders,
    pub raw_body: String,
    pub source_ip: Option<String>,
    pub content_length: i64,
    pub received_at: DateTime<Utc>,
}

impl From<StoredEvent> for EventResponse {
    fn from(event: StoredEvent) -> Self {
        Self {
            id: event.id,
            stream_id: event.stream_id,
            method: event.method,
            path: event.path,
            headers: event.headers,
            raw_body: BASE64.encode(&event.raw_body),
            source_ip: event.source_ip,
            content_length: event.content_length,
            received_at: event.received_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPageResponse {
    pub data: Vec<EventResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}
