//! Re-delivery of captured events to operator-chosen targets.
//!
//! One replay call validates the target, then makes up to
//! `max_retries + 1` sequential attempts. Every attempt is written to the
//! ledger once it concludes. Only `error` outcomes are retried; a `timeout`
//! ends the call.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    redirect, Client, Method, StatusCode, Url,
};
use uuid::Uuid;

use crate::{
    config::ReplayPolicy,
    db::{AttemptLedger, EventStore},
    domain::{
        AttemptStatus, CapturedHeaders, NewReplayAttempt, ReplayOutcome, ReplayRequest,
        StoredEvent,
    },
    errors::AppError,
    ssrf::{EgressPolicy, ValidatedTarget},
};

const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Captured headers that describe the original connection, not the payload.
const NOT_REPLAYED: [&str; 4] = ["host", "content-length", "transfer-encoding", "connection"];

pub struct ReplayEngine {
    events: Arc<dyn EventStore>,
    ledger: Arc<dyn AttemptLedger>,
    egress: Arc<dyn EgressPolicy>,
    policy: ReplayPolicy,
}

struct Outbound {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ReplayEngine {
    pub fn new(
        events: Arc<dyn EventStore>,
        ledger: Arc<dyn AttemptLedger>,
        egress: Arc<dyn EgressPolicy>,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            events,
            ledger,
            egress,
            policy,
        }
    }

    /// Replays `event_id` and returns the outcome of the last attempt made.
    ///
    /// Fails only before any attempt: unknown event, rejected target, or
    /// invalid override headers. Delivery failures come back as outcomes.
    pub async fn replay(
        &self,
        event_id: Uuid,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, AppError> {
        let event = self.events.get_event(event_id).await?;
        let target = self.egress.check(&request.target_url).await.map_err(|rejection| {
            tracing::warn!(
                %event_id,
                target = %request.target_url,
                reason = %rejection,
                "replay target rejected"
            );
            AppError::from(rejection)
        })?;

        let headers = merge_headers(&event.headers, request.override_headers.as_ref())?;
        let body = resolve_body(&event, request.override_body.as_deref());
        let method = Method::from_bytes(event.method.as_bytes())
            .map_err(|_| AppError::internal("stored event contains invalid HTTP method"))?;
        let client = outbound_client(&target)?;
        let outbound = Outbound {
            method,
            url: target.url,
            headers,
            body,
        };

        let max_attempts = self.policy.max_attempts();
        let mut last = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.backoff_before_retry(attempt - 1);
                tracing::info!(
                    %event_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = self.execute(&client, &outbound).await;
            self.ledger
                .create_attempt(NewReplayAttempt {
                    event_id,
                    target_url: request.target_url.clone(),
                    attempt_number: attempt as i32,
                    outcome: outcome.clone(),
                })
                .await?;
            tracing::info!(
                %event_id,
                attempt,
                status = outcome.status.as_str(),
                duration_ms = outcome.duration_ms,
                response_status = outcome.response_status,
                "replay attempt finished"
            );

            let retry = outcome.status == AttemptStatus::Error;
            last = Some(outcome);
            if !retry {
                break;
            }
        }

        last.ok_or_else(|| AppError::internal("replay made no attempts"))
    }

    async fn execute(&self, client: &Client, outbound: &Outbound) -> ReplayOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.policy.attempt_timeout,
            send(client, outbound, self.policy.max_response_bytes),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Err(_) => timed_out(duration_ms),
            Ok(Err(err)) if err.is_timeout() => timed_out(duration_ms),
            Ok(Err(err)) => ReplayOutcome {
                status: AttemptStatus::Error,
                duration_ms,
                response_status: None,
                response_body: None,
                error_message: Some(err.to_string()),
            },
            Ok(Ok((status, body))) => ReplayOutcome {
                status: if status.is_success() {
                    AttemptStatus::Success
                } else {
                    AttemptStatus::Error
                },
                duration_ms,
                response_status: Some(i32::from(status.as_u16())),
                response_body: Some(body),
                error_message: (!status.is_success()).then(|| format!("HTTP {}", status.as_u16())),
            },
        }
    }
}

fn timed_out(duration_ms: i64) -> ReplayOutcome {
    ReplayOutcome {
        status: AttemptStatus::Timeout,
        duration_ms,
        response_status: None,
        response_body: None,
        error_message: Some("Request timeout".into()),
    }
}

async fn send(
    client: &Client,
    outbound: &Outbound,
    max_response_bytes: usize,
) -> Result<(StatusCode, String), reqwest::Error> {
    let mut request = client
        .request(outbound.method.clone(), outbound.url.clone())
        .headers(outbound.headers.clone());
    if outbound.method != Method::GET && outbound.method != Method::HEAD {
        request = request.body(outbound.body.clone());
    }

    let mut response = request.send().await?;
    let status = response.status();

    let mut buf = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await? {
        let room = max_response_bytes - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        // Reaching the cap ends the read, even if the body happened to end there too.
        if buf.len() >= max_response_bytes {
            truncated = true;
            break;
        }
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok((status, text))
}

/// No redirects, no ambient proxies, and domain targets connect only to the
/// addresses that were validated.
fn outbound_client(target: &ValidatedTarget) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .redirect(redirect::Policy::none())
        .no_proxy();
    if let Some((host, addrs)) = &target.pinned {
        builder = builder.resolve_to_addrs(host, addrs);
    }
    builder
        .build()
        .map_err(|err| AppError::internal(format!("failed to build replay client: {err}")))
}

/// Captured headers with overrides applied on top; an override wins per name.
fn merge_headers(
    captured: &CapturedHeaders,
    overrides: Option<&BTreeMap<String, String>>,
) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    for (name, value) in captured {
        if NOT_REPLAYED.contains(&name.as_str()) {
            continue;
        }
        let parsed = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!(
                header = %name,
                "skipping captured header that cannot be replayed"
            ),
        }
    }

    for (name, value) in overrides.into_iter().flatten() {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|_| AppError::validation(format!("invalid override header name: {name}")))?;
        if NOT_REPLAYED.contains(&name.as_str()) {
            return Err(AppError::validation(format!(
                "header {name} is set by the outbound connection and cannot be overridden"
            )));
        }
        let value = HeaderValue::try_from(value.as_str()).map_err(|_| {
            AppError::validation(format!("invalid value for override header {name}"))
        })?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// The captured body, or an override: base64 when it decodes, literal text otherwise.
fn resolve_body(event: &StoredEvent, override_body: Option<&str>) -> Vec<u8> {
    match override_body {
        Some(raw) => BASE64
            .decode(raw)
            .unwrap_or_else(|_| raw.as_bytes().to_vec()),
        None => event.raw_body.clone(),
    }
}
