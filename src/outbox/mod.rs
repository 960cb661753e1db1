//! Transactional outbox.
//!
//! Producers call [`emit`] with the same transaction that carries their
//! business change, so the event row commits (or rolls back) atomically with
//! it. Nothing leaves the process at that point: the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) later claims unpublished
//! rows through an [`OutboxStore`] and appends them to the event log.
//!
//! Claiming is the only cross-instance coordination: a [`ClaimedBatch`] holds
//! row locks (PostgreSQL `FOR UPDATE SKIP LOCKED`) until it is committed or
//! dropped, so concurrent dispatchers skip each other's rows instead of
//! blocking on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::event::OutboxRow;

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod schema;
#[cfg(feature = "postgres")]
mod writer;

pub use mock::MockOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;
#[cfg(feature = "postgres")]
pub use writer::emit;

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid event type: {0:?}")]
    InvalidEventType(String),

    #[error("Row {0} is not part of this batch")]
    NotClaimed(Uuid),

    #[error("Outbox unavailable: {0}")]
    Unavailable(String),
}

impl OutboxError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            OutboxError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            OutboxError::Unavailable(_) => true,
            OutboxError::InvalidEventType(_) | OutboxError::NotClaimed(_) => false,
        }
    }
}

/// Reject empty or whitespace-only routing keys before they reach storage.
pub(crate) fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(OutboxError::InvalidEventType(event_type.to_string()));
    }
    Ok(())
}

/// Storage for outbox rows, as used by the dispatcher.
///
/// Implementations:
/// - `PostgresOutboxStore`: PostgreSQL with skip-locked claiming
/// - `MockOutboxStore`: In-memory store emulating row locks, for tests
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a row in its own short transaction.
    ///
    /// Producers that have a transaction should use [`emit`] instead.
    async fn insert(&self, event_type: &str, payload: Value) -> Result<OutboxRow>;

    /// Claim up to `limit` unpublished rows, oldest first.
    ///
    /// Rows locked by another open batch are skipped, not waited on.
    async fn claim(&self, limit: u32) -> Result<Box<dyn ClaimedBatch>>;

    /// Delete published rows whose `published_at` is older than `cutoff`.
    ///
    /// Unpublished rows are never deleted, regardless of age.
    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A set of rows claimed inside one open transaction.
///
/// Dropping a batch without calling [`ClaimedBatch::commit`] rolls back any
/// marks made through it and releases the claimed rows.
#[async_trait]
pub trait ClaimedBatch: Send {
    /// Claimed rows, ordered by `created_at` ascending.
    fn rows(&self) -> &[OutboxRow];

    /// Record that a claimed row has been appended to the stream.
    async fn mark_published(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Make all marks durable and release the claim.
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_event_type() {
        assert!(validate_event_type("wallet.created").is_ok());
        assert!(matches!(
            validate_event_type(""),
            Err(OutboxError::InvalidEventType(_))
        ));
        assert!(matches!(
            validate_event_type("   "),
            Err(OutboxError::InvalidEventType(_))
        ));
    }
}
