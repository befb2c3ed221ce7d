use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use uuid::Uuid;

use crate::{
    db::{AttemptLedger, EventStore, StreamRegistry},
    domain::{
        CapturedHeaders, EventFilters, NewEvent, NewReplayAttempt, ReplayAttempt, StoredEvent,
        Stream,
    },
    errors::AppError,
    pagination::{Cursor, EventPage},
};

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| AppError::internal(format!("migration failed: {err}")))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    stream_id: Uuid,
    method: String,
    path: String,
    headers: Json<CapturedHeaders>,
    raw_body: Vec<u8>,
    source_ip: Option<String>,
    content_length: i64,
    received_at: DateTime<Utc>,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            stream_id: row.stream_id,
            method: row.method,
            path: row.path,
            headers: row.headers.0,
            raw_body: row.raw_body,
            source_ip: row.source_ip,
            content_length: row.content_length,
            received_at: row.received_at,
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        Ok(Self::new(connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent, AppError> {
        let content_length = event.raw_body.len() as i64;
        let created = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO events
                (stream_id, method, path, headers, raw_body, source_ip, content_length)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, stream_id, method, path, headers, raw_body, source_ip,
                      content_length, received_at
            "#,
        )
        .bind(event.stream_id)
        .bind(event.method)
        .bind(event.path)
        .bind(Json(event.headers))
        .bind(event.raw_body)
        .bind(event.source_ip)
        .bind(content_length)
        .fetch_one(&self.pool)
        .await?;

        Ok(created.into())
    }

    async fn get_event(&self, id: Uuid) -> Result<StoredEvent, AppError> {
        let event = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, stream_id, method, path, headers, raw_body, source_ip,
                   content_length, received_at
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        event
            .map(Into::into)
            .ok_or_else(|| AppError::not_found(format!("event not found: {id}")))
    }

    async fn find_events(
        &self,
        filters: &EventFilters,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<EventPage, AppError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, stream_id, method, path, headers, raw_body, source_ip,
                   content_length, received_at
            FROM events
            WHERE ($1::uuid IS NULL OR stream_id = $1)
              AND ($2::text IS NULL OR method = $2)
              AND ($3::timestamptz IS NULL OR received_at >= $3)
              AND ($4::timestamptz IS NULL OR received_at <= $4)
              AND ($5::timestamptz IS NULL
                   OR received_at < $5
                   OR (received_at = $5 AND id < $6))
            ORDER BY received_at DESC, id DESC
            LIMIT $7
            "#,
        )
        .bind(filters.stream_id)
        .bind(filters.method.as_deref())
        .bind(filters.start_date)
        .bind(filters.end_date)
        .bind(cursor.map(|c| c.received_at))
        .bind(cursor.map(|c| c.id))
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(EventPage::from_overfetch(
            rows.into_iter().map(Into::into).collect(),
            limit,
        ))
    }
}

#[async_trait]
impl StreamRegistry for PgStore {
    async fn create_stream(
        &self,
        owner_id: &str,
        token: String,
        name: Option<String>,
    ) -> Result<Stream, AppError> {
        let created = sqlx::query_as::<_, Stream>(
            r#"
            INSERT INTO streams (owner_id, token, name)
            VALUES ($1, $2, $3)
            RETURNING id, owner_id, token, name, created_at
            "#,
        )
        .bind(owner_id)
        .bind(token)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("stream token already exists".into())
            }
            _ => AppError::Database(err),
        })?;

        Ok(created)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Stream>, AppError> {
        let stream = sqlx::query_as::<_, Stream>(
            r#"
            SELECT id, owner_id, token, name, created_at
            FROM streams
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stream)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Stream>, AppError> {
        let streams = sqlx::query_as::<_, Stream>(
            r#"
            SELECT id, owner_id, token, name, created_at
            FROM streams
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(streams)
    }
}

#[async_trait]
impl AttemptLedger for PgStore {
    async fn create_attempt(&self, attempt: NewReplayAttempt) -> Result<ReplayAttempt, AppError> {
        let outcome = attempt.outcome;
        let created = sqlx::query_as::<_, ReplayAttempt>(
            r#"
            INSERT INTO replay_attempts
                (event_id, target_url, attempt_number, status, duration_ms,
                 response_status, response_body, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, event_id, target_url, attempt_number, status, duration_ms,
                      response_status, response_body, error_message, created_at
            "#,
        )
        .bind(attempt.event_id)
        .bind(attempt.target_url)
        .bind(attempt.attempt_number)
        .bind(outcome.status)
        .bind(outcome.duration_ms)
        .bind(outcome.response_status)
        .bind(outcome.response_body)
        .bind(outcome.error_message)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Vec<ReplayAttempt>, AppError> {
        let attempts = sqlx::query_as::<_, ReplayAttempt>(
            r#"
            SELECT id, event_id, target_url, attempt_number, status, duration_ms,
                   response_status, response_body, error_message, created_at
            FROM replay_attempts
            WHERE event_id = $1
            ORDER BY created_at DESC, attempt_number DESC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }
}
