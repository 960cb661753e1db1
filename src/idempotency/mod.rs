//! Consumer-side delivery bookkeeping.
//!
//! Two pieces of state live outside the consumer process so that every
//! instance of a consuming service shares them:
//!
//! - the idempotency marker, one per event id, set at most once within its
//!   TTL. Whoever sets it owns the processing attempt.
//! - the retry counter, one per stream entry, counting failed attempts.
//! - the dead-letter mark, one per stream entry, set once the entry has been
//!   copied to the dead-letter stream. A reclaim that finds it only acks.
//!
//! Keys are namespaced by service name so that two services consuming the
//! same stream keep independent bookkeeping.

use std::time::Duration;

use async_trait::async_trait;

pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use mock::MockDeliveryTracker;
#[cfg(feature = "redis")]
pub use self::redis::RedisDeliveryTracker;

/// Result type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors from the delivery tracker backend.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Tracker unavailable: {0}")]
    Unavailable(String),
}

impl TrackerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            TrackerError::Redis(e) => crate::stream::is_transient_redis(e),
            TrackerError::Unavailable(_) => true,
        }
    }
}

/// Key of the idempotency marker for an event.
pub fn idempotency_key(service: &str, event_id: &str) -> String {
    format!("{service}:idempotency:{event_id}")
}

/// Key of the retry counter for a stream entry.
pub fn retry_key(service: &str, entry_id: &str) -> String {
    format!("{service}:retries:{entry_id}")
}

/// Key of the mark recording that a stream entry was dead-lettered.
pub fn dead_letter_key(service: &str, entry_id: &str) -> String {
    format!("{service}:dead-lettered:{entry_id}")
}

/// Shared idempotency markers and retry counters.
///
/// Implementations:
/// - `RedisDeliveryTracker`: `SET NX EX` markers, `INCR` + `EXPIRE` counters
/// - `MockDeliveryTracker`: In-memory tracker for testing
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    /// Set the marker for `event_id` unless present.
    ///
    /// Returns `true` when this call set it; `false` means the event was
    /// already processed (or is being processed) within the TTL.
    async fn claim(&self, event_id: &str, ttl: Duration) -> Result<bool>;

    /// Remove the marker so the event can be processed again.
    async fn release(&self, event_id: &str) -> Result<()>;

    /// Count a failed attempt for a stream entry and return the new total.
    ///
    /// The counter expires `ttl` after the latest failure.
    async fn record_failure(&self, entry_id: &str, ttl: Duration) -> Result<u64>;

    /// Record that a stream entry reached the dead-letter stream.
    async fn mark_dead_lettered(&self, entry_id: &str, ttl: Duration) -> Result<()>;

    /// Whether the entry was already dead-lettered.
    async fn is_dead_lettered(&self, entry_id: &str) -> Result<bool>;

    /// Drop the retry counter and dead-letter mark for a stream entry.
    async fn clear_failures(&self, entry_id: &str) -> Result<()>;
}
