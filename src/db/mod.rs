use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    domain::{EventFilters, NewEvent, NewReplayAttempt, ReplayAttempt, StoredEvent, Stream},
    errors::AppError,
    pagination::{Cursor, EventPage},
};

pub mod memory;
pub mod pg;

pub use pg::{connect, run_migrations};

/// Append-only record of captured deliveries.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent, AppError>;
    async fn get_event(&self, id: Uuid) -> Result<StoredEvent, AppError>;
    /// Rows matching `filters`, strictly after `cursor`, newest first.
    async fn find_events(
        &self,
        filters: &EventFilters,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<EventPage, AppError>;
}

#[async_trait]
pub trait StreamRegistry: Send + Sync {
    async fn create_stream(
        &self,
        owner_id: &str,
        token: String,
        name: Option<String>,
    ) -> Result<Stream, AppError>;
    async fn find_by_token(&self, token: &str) -> Result<Option<Stream>, AppError>;
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Stream>, AppError>;
}

/// Append-only audit trail of replay attempts.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    async fn create_attempt(&self, attempt: NewReplayAttempt) -> Result<ReplayAttempt, AppError>;
    /// Attempts for one event, newest first.
    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Vec<ReplayAttempt>, AppError>;
}
