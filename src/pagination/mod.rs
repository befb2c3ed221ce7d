//! Compound `(received_at, id)` cursors for walking events newest first.
//!
//! A cursor names the last row of the previous page; the next page holds rows
//! strictly after it in `(received_at DESC, id DESC)` order. The store is
//! append-only, so a walk never repeats or skips a row even while captures are
//! being committed.

use std::cmp::Ordering;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{domain::StoredEvent, errors::AppError};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub received_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorWire {
    received_at: String,
    id: Uuid,
}

impl Cursor {
    pub fn of(event: &StoredEvent) -> Self {
        Self {
            received_at: event.received_at,
            id: event.id,
        }
    }

    pub fn encode(&self) -> String {
        let wire = CursorWire {
            received_at: self
                .received_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            id: self.id,
        };
        // Serializing a string and a uuid cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        let invalid = || AppError::validation("invalid cursor");
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim_end_matches('='))
            .map_err(|_| invalid())?;
        let wire: CursorWire = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        let received_at = DateTime::parse_from_rfc3339(&wire.received_at)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        Ok(Self {
            received_at,
            id: wire.id,
        })
    }

    /// True when `event` sorts strictly after this cursor in the listing order.
    pub fn precedes(&self, event: &StoredEvent) -> bool {
        event.received_at < self.received_at
            || (event.received_at == self.received_at && event.id < self.id)
    }
}

/// Listing order: newest first, ties broken by descending id.
pub fn listing_order(a: &StoredEvent, b: &StoredEvent) -> Ordering {
    b.received_at
        .cmp(&a.received_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Accepts an optional `limit` query value, defaulting and bounding it.
pub fn page_size(limit: Option<usize>) -> Result<usize, AppError> {
    match limit {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(limit) if (1..=MAX_PAGE_SIZE).contains(&limit) => Ok(limit),
        Some(limit) => Err(AppError::validation(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct EventPage {
    pub items: Vec<StoredEvent>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl EventPage {
    /// Builds a page from up to `limit + 1` ordered rows; the extra row only
    /// signals that another page exists.
    pub fn from_overfetch(mut rows: Vec<StoredEvent>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more { rows.last().map(Cursor::of) } else { None };
        Self {
            items: rows,
            next_cursor,
            has_more,
        }
    }
}
