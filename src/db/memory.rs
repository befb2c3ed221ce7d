use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    db::{AttemptLedger, EventStore, StreamRegistry},
    domain::{
        EventFilters, NewEvent, NewReplayAttempt, ReplayAttempt, StoredEvent, Stream,
    },
    errors::AppError,
    pagination::{listing_order, Cursor, EventPage},
};

/// In-process store backing all three persistence seams.
#[derive(Clone, Default)]
pub struct MemoryStore {
    streams: Arc<RwLock<Vec<Stream>>>,
    events: Arc<RwLock<Vec<StoredEvent>>>,
    attempts: Arc<RwLock<Vec<ReplayAttempt>>>,
}

#[cfg(test)]
impl MemoryStore {
    /// Inserts an event with a caller-chosen capture time.
    pub async fn insert_event_at(
        &self,
        event: NewEvent,
        received_at: DateTime<Utc>,
    ) -> StoredEvent {
        let stored = into_stored(event, received_at);
        self.events.write().await.push(stored.clone());
        stored
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

fn into_stored(event: NewEvent, received_at: DateTime<Utc>) -> StoredEvent {
    StoredEvent {
        id: Uuid::new_v4(),
        stream_id: event.stream_id,
        method: event.method,
        path: event.path,
        headers: event.headers,
        content_length: event.raw_body.len() as i64,
        raw_body: event.raw_body,
        source_ip: event.source_ip,
        received_at,
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent, AppError> {
        let mut events = self.events.write().await;
        // Commit times strictly increase even if the wall clock stalls or steps back.
        let latest = events.iter().map(|e| e.received_at).max();
        let now = Utc::now();
        let received_at = match latest {
            Some(latest) if now <= latest => latest + chrono::Duration::microseconds(1),
            _ => now,
        };
        let stored = into_stored(event, received_at);
        events.push(stored.clone());
        Ok(stored)
    }

    async fn get_event(&self, id: Uuid) -> Result<StoredEvent, AppError> {
        let maybe = self
            .events
            .read()
            .await
            .iter()
            .find(|event| event.id == id)
            .cloned();

        maybe.ok_or_else(|| AppError::not_found(format!("event not found: {id}")))
    }

    async fn find_events(
        &self,
        filters: &EventFilters,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<EventPage, AppError> {
        let mut rows: Vec<StoredEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|event| filters.matches(event))
            .filter(|event| cursor.map_or(true, |c| c.precedes(event)))
            .cloned()
            .collect();
        rows.sort_by(listing_order);
        rows.truncate(limit + 1);
        Ok(EventPage::from_overfetch(rows, limit))
    }
}

#[async_trait]
impl StreamRegistry for MemoryStore {
    async fn create_stream(
        &self,
        owner_id: &str,
        token: String,
        name: Option<String>,
    ) -> Result<Stream, AppError> {
        let mut streams = self.streams.write().await;
        if streams.iter().any(|stream| stream.token == token) {
            return Err(AppError::Conflict("stream token already exists".into()));
        }
        let stream = Stream {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_owned(),
            token,
            name,
            created_at: Utc::now(),
        };
        streams.push(stream.clone());
        Ok(stream)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Stream>, AppError> {
        Ok(self
            .streams
            .read()
            .await
            .iter()
            .find(|stream| stream.token == token)
            .cloned())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Stream>, AppError> {
        let mut streams: Vec<Stream> = self
            .streams
            .read()
            .await
            .iter()
            .rev()
            .filter(|stream| stream.owner_id == owner_id)
            .cloned()
            .collect();
        streams.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(streams)
    }
}

#[async_trait]
impl AttemptLedger for MemoryStore {
    async fn create_attempt(&self, attempt: NewReplayAttempt) -> Result<ReplayAttempt, AppError> {
        let outcome = attempt.outcome;
        let stored = ReplayAttempt {
            id: Uuid::new_v4(),
            event_id: attempt.event_id,
            target_url: attempt.target_url,
            attempt_number: attempt.attempt_number,
            status: outcome.status,
            duration_ms: outcome.duration_ms,
            response_status: outcome.response_status,
            response_body: outcome.response_body,
            error_message: outcome.error_message,
            created_at: Utc::now(),
        };
        self.attempts.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Vec<ReplayAttempt>, AppError> {
        let mut attempts: Vec<ReplayAttempt> = self
            .attempts
            .read()
            .await
            .iter()
            .rev()
            .filter(|attempt| attempt.event_id == event_id)
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }
}
