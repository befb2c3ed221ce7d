//! Byte-exact capture of inbound deliveries under a size cap and a deadline.

use std::{fmt::Display, net::SocketAddr};

use axum::{
    body::Bytes,
    http::{header, HeaderMap},
};
use futures_util::{Stream as ByteStream, StreamExt};

use crate::{
    config::CaptureLimits,
    db::{EventStore, StreamRegistry},
    domain::{CapturedHeaders, NewEvent, StoredEvent},
    errors::AppError,
};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Everything about an inbound delivery except its body.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub token: String,
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub peer_addr: Option<SocketAddr>,
}

/// Resolves the token, drains `body` within `limits`, and commits one event.
///
/// Nothing is written unless the whole body arrived inside both bounds.
pub async fn capture<S, E>(
    registry: &dyn StreamRegistry,
    store: &dyn EventStore,
    limits: &CaptureLimits,
    delivery: InboundDelivery,
    body: S,
) -> Result<StoredEvent, AppError>
where
    S: ByteStream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Display,
{
    let bounded = async {
        let stream = registry
            .find_by_token(&delivery.token)
            .await?
            .ok_or_else(|| AppError::not_found("Stream not found"))?;
        check_declared_length(&delivery.headers, limits.max_body_bytes)?;
        let raw_body = read_bounded(body, limits.max_body_bytes).await?;
        Ok::<_, AppError>((stream, raw_body))
    };

    let (stream, raw_body) = tokio::time::timeout(limits.deadline, bounded)
        .await
        .map_err(|_| {
            tracing::warn!(
                deadline_ms = limits.deadline.as_millis() as u64,
                "capture deadline exceeded"
            );
            AppError::Timeout
        })??;

    let source_ip = source_ip(&delivery.headers, delivery.peer_addr, limits.trust_proxy);
    let event = store
        .create_event(NewEvent {
            stream_id: stream.id,
            method: delivery.method,
            path: delivery.path,
            headers: normalize_headers(&delivery.headers),
            raw_body,
            source_ip,
        })
        .await?;

    tracing::info!(
        event_id = %event.id,
        stream_id = %event.stream_id,
        bytes = event.content_length,
        "captured delivery"
    );
    Ok(event)
}

/// Reads `body` to the end, failing as soon as the running total passes `max`.
pub async fn read_bounded<S, E>(mut body: S, max: usize) -> Result<Vec<u8>, AppError>
where
    S: ByteStream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk
            .map_err(|err| AppError::validation(format!("failed to read request body: {err}")))?;
        if buf.len() + chunk.len() > max {
            return Err(too_large(max));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn check_declared_length(headers: &HeaderMap, max: usize) -> Result<(), AppError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    match declared {
        Some(len) if len > max as u64 => Err(too_large(max)),
        _ => Ok(()),
    }
}

fn too_large(max: usize) -> AppError {
    AppError::PayloadTooLarge(format!("Request body exceeds {}KB limit", max / 1024))
}

/// One value per header name; the first occurrence of a repeated name wins.
pub fn normalize_headers(headers: &HeaderMap) -> CapturedHeaders {
    let mut captured = CapturedHeaders::new();
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(text) => text.to_owned(),
            Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };
        captured.entry(name.as_str().to_owned()).or_insert(value);
    }
    captured
}

/// Client address: the originating hop of `X-Forwarded-For` when proxies are
/// trusted, otherwise the socket peer.
pub fn source_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> Option<String> {
    let forwarded = trust_proxy
        .then(|| headers.get(FORWARDED_FOR))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .and_then(|first| first.trim().parse::<std::net::IpAddr>().ok());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use axum::http::HeaderValue;
    use futures_util::stream;

    use super::*;
    use crate::db::memory::MemoryStore;

    const LIMIT: usize = 1024;

    fn limits() -> CaptureLimits {
        CaptureLimits {
            max_body_bytes: LIMIT,
            deadline: Duration::from_secs(5),
            trust_proxy: false,
        }
    }

    fn delivery(token: &str) -> InboundDelivery {
        InboundDelivery {
            token: token.into(),
            method: "POST".into(),
            path: format!("/i/{token}"),
            headers: HeaderMap::new(),
            peer_addr: Some("203.0.113.9:5555".parse().unwrap()),
        }
    }

    fn chunks(
        parts: Vec<Vec<u8>>,
    ) -> impl ByteStream<Item = Result<Bytes, Infallible>> + Unpin + Send {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    /// A sender that never delivers a byte.
    fn silent() -> impl ByteStream<Item = Result<Bytes, Infallible>> + Unpin + Send {
        stream::pending()
    }

    async fn store_with_stream() -> MemoryStore {
        let store = MemoryStore::default();
        store.create_stream("admin", "tok".into(), None).await.unwrap();
        store
    }

    #[tokio::test]
    async fn body_at_the_limit_is_captured_byte_for_byte() {
        let store = store_with_stream().await;
        let body: Vec<u8> = (0..LIMIT).map(|i| (i % 256) as u8).collect();
        let parts = body.chunks(100).map(<[u8]>::to_vec).collect();

        let event = capture(&store, &store, &limits(), delivery("tok"), chunks(parts))
            .await
            .expect("capture should succeed");

        assert_eq!(event.raw_body, body);
        assert_eq!(event.content_length, LIMIT as i64);
        assert_eq!(event.source_ip.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn one_byte_over_is_rejected_and_nothing_is_stored() {
        let store = store_with_stream().await;
        let parts = vec![vec![0u8; LIMIT], vec![1u8]];

        let err = capture(&store, &store, &limits(), delivery("tok"), chunks(parts))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PayloadTooLarge(_)));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn endless_senders_are_cut_off() {
        let store = store_with_stream().await;
        let endless = stream::repeat(Ok::<_, Infallible>(Bytes::from_static(&[7u8; 64])));

        let err = capture(&store, &store, &limits(), delivery("tok"), endless)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_up_front() {
        let store = store_with_stream().await;
        let mut inbound = delivery("tok");
        inbound
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(LIMIT as u64 + 1));

        let err = capture(&store, &store, &limits(), inbound, silent())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn stalled_senders_hit_the_deadline() {
        let store = store_with_stream().await;
        let limits = CaptureLimits {
            deadline: Duration::from_millis(50),
            ..limits()
        };

        let err = capture(&store, &store, &limits, delivery("tok"), silent())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Timeout));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_tokens_are_not_found() {
        let store = store_with_stream().await;
        for token in ["nope", "", "../../etc"] {
            let body = chunks(vec![b"{}".to_vec()]);
            let err = capture(&store, &store, &limits(), delivery(token), body)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
        }
    }

    #[test]
    fn first_header_occurrence_wins() {
        let mut headers = HeaderMap::new();
        headers.append("x-dup", HeaderValue::from_static("first"));
        headers.append("x-dup", HeaderValue::from_static("second"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let captured = normalize_headers(&headers);
        assert_eq!(captured["x-dup"], "first");
        assert_eq!(captured["content-type"], "application/json");
    }

    #[test]
    fn forwarded_for_is_used_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("198.51.100.7, 10.0.0.1"));
        let peer = Some("10.0.0.1:4000".parse().unwrap());

        assert_eq!(source_ip(&headers, peer, true).as_deref(), Some("198.51.100.7"));
        assert_eq!(source_ip(&headers, peer, false).as_deref(), Some("10.0.0.1"));
        assert_eq!(source_ip(&HeaderMap::new(), None, true), None);
    }
}
