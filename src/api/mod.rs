use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    auth::{AuthPrincipal, Authenticator},
    config::CaptureLimits,
    db::{AttemptLedger, EventStore, StreamRegistry},
    domain::{
        CreateStreamRequest, EventFilters, EventPageResponse, EventResponse, IngestResponse,
        ListResponse, ReplayAttempt, ReplayOutcome, ReplayRequest, Stream,
    },
    errors::AppError,
    ingest::{self, InboundDelivery},
    pagination::{self, Cursor},
    replay::ReplayEngine,
};

const STREAM_TOKEN_BYTES: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub streams: Arc<dyn StreamRegistry>,
    pub attempts: Arc<dyn AttemptLedger>,
    pub auth: Arc<dyn Authenticator>,
    pub replay: Arc<ReplayEngine>,
    pub capture: CaptureLimits,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/i/{token}", post(ingest))
        .route("/i/{token}/{*rest}", post(ingest))
        .route("/streams", get(list_streams).post(create_stream))
        .route("/events", get(list_events))
        .route("/events/{id}", get(get_event))
        .route("/events/{id}/replay", post(replay_event))
        .route("/events/{id}/replays", get(list_replays))
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            // Ingest URIs carry the stream token, so only the route pattern is logged.
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map(MatchedPath::as_str)
                .unwrap_or("unmatched");
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!("request", method = %request.method(), route, request_id)
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct IngestPath {
    token: String,
}

async fn ingest(
    State(state): State<AppState>,
    Path(IngestPath { token }): Path<IngestPath>,
    request: Request,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let (parts, body) = request.into_parts();
    let peer_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let event = ingest::capture(
        state.streams.as_ref(),
        state.events.as_ref(),
        &state.capture,
        InboundDelivery {
            token,
            method: parts.method.to_string(),
            path: parts.uri.path().to_owned(),
            headers: parts.headers,
            peer_addr,
        },
        Box::pin(body.into_data_stream()),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(IngestResponse { id: event.id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListQuery {
    cursor: Option<String>,
    limit: Option<String>,
    stream_id: Option<String>,
    method: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_date(name: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    non_empty(value)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|at| at.with_timezone(&Utc))
                .map_err(|_| AppError::validation(format!("{name} must be an RFC 3339 timestamp")))
        })
        .transpose()
}

async fn list_events(
    State(state): State<AppState>,
    AuthPrincipal(_principal): AuthPrincipal,
    Query(query): Query<EventListQuery>,
) -> Result<Json<EventPageResponse>, AppError> {
    let limit = non_empty(query.limit)
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|_| AppError::validation("limit must be a positive integer"))
        })
        .transpose()?;
    let limit = pagination::page_size(limit)?;
    let cursor = non_empty(query.cursor)
        .map(|raw| Cursor::decode(raw.trim()))
        .transpose()?;
    let stream_id = non_empty(query.stream_id)
        .map(|raw| {
            raw.trim()
                .parse::<Uuid>()
                .map_err(|_| AppError::validation("streamId must be a UUID"))
        })
        .transpose()?;
    let filters = EventFilters {
        stream_id,
        method: non_empty(query.method),
        start_date: parse_date("startDate", query.start_date)?,
        end_date: parse_date("endDate", query.end_date)?,
    };

    let page = state.events.find_events(&filters, limit, cursor).await?;

    Ok(Json(EventPageResponse {
        data: page.items.into_iter().map(EventResponse::from).collect(),
        next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
        has_more: page.has_more,
    }))
}

/// Ids that are not UUIDs cannot name an event.
fn event_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::not_found(format!("event not found: {raw}")))
}

async fn get_event(
    State(state): State<AppState>,
    AuthPrincipal(_principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<EventResponse>, AppError> {
    let event = state.events.get_event(event_id(&id)?).await?;
    Ok(Json(event.into()))
}

async fn replay_event(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
    payload: Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<Json<ReplayOutcome>, AppError> {
    let id = event_id(&id)?;
    let Json(payload) = payload.map_err(|rejection| {
        AppError::validation(format!("Invalid request body: {}", rejection.body_text()))
    })?;

    tracing::info!(event_id = %id, principal = %principal.id, "replay requested");
    let outcome = state.replay.replay(id, payload).await?;
    Ok(Json(outcome))
}

async fn list_replays(
    State(state): State<AppState>,
    AuthPrincipal(_principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<ListResponse<ReplayAttempt>>, AppError> {
    let event = state.events.get_event(event_id(&id)?).await?;
    let data = state.attempts.find_by_event_id(event.id).await?;
    Ok(Json(ListResponse { data }))
}

async fn create_stream(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    body: Bytes,
) -> Result<(StatusCode, Json<Stream>), AppError> {
    let request: CreateStreamRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateStreamRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::validation(format!("Invalid request body: {err}")))?
    };

    let stream = state
        .streams
        .create_stream(&principal.id, generate_token(), request.name)
        .await?;
    tracing::info!(stream_id = %stream.id, owner = %principal.id, "stream created");

    Ok((StatusCode::CREATED, Json(stream)))
}

async fn list_streams(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
) -> Result<Json<ListResponse<Stream>>, AppError> {
    let data = state.streams.list_by_owner(&principal.id).await?;
    Ok(Json(ListResponse { data }))
}

/// 256 bits from the OS generator, URL-safe so it can sit in a path segment.
fn generate_token() -> String {
    let mut bytes = [0u8; STREAM_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
