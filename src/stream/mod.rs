//! Append-only event log with consumer groups.
//!
//! The dispatcher appends entries; consumers read them through a named
//! consumer group, acknowledge them, and reclaim entries another consumer
//! left pending for too long. The shape follows Redis Streams
//! (`XADD`, `XREADGROUP`, `XAUTOCLAIM`, `XACK`), which is the production
//! backend; [`MockEventLog`] implements the same semantics in memory.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use mock::MockEventLog;
#[cfg(feature = "redis")]
pub use self::redis::{RedisClient, RedisEventLog};

/// Result type for event log operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur during event log operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("No such consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl StreamError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Connection loss, I/O errors and timeouts are transient. A missing
    /// consumer group is also treated as transient: the consumer recreates
    /// it on the next iteration.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            StreamError::Redis(e) => is_transient_redis(e),
            StreamError::Connection(_) | StreamError::NoGroup { .. } => true,
            StreamError::UnexpectedReply(_) => false,
        }
    }

    /// Whether the error means the consumer group does not exist.
    pub fn is_missing_group(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            StreamError::Redis(e) => e.code() == Some("NOGROUP"),
            StreamError::NoGroup { .. } => true,
            _ => false,
        }
    }
}

/// Redis failures worth retrying: lost connections, timeouts, a server
/// still loading its dataset, and a consumer group that must be recreated.
#[cfg(feature = "redis")]
pub(crate) fn is_transient_redis(e: &::redis::RedisError) -> bool {
    e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(e.code(), Some("NOGROUP" | "TRYAGAIN" | "LOADING"))
}

/// One entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Server-assigned id (`<ms>-<seq>`), unique per append.
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One page of a reclaim scan.
#[derive(Debug, Clone, Default)]
pub struct ClaimPage {
    /// Cursor for the next page; `"0-0"` once the pending list is exhausted.
    pub next_cursor: String,
    /// Entries now owned by the claiming consumer.
    pub entries: Vec<StreamEntry>,
    /// Pending ids whose entries were trimmed or deleted from the stream.
    /// They are dropped from the pending list by the scan itself.
    pub deleted_ids: Vec<String>,
}

/// Cursor value that starts a reclaim scan and marks its end.
pub const CLAIM_CURSOR_START: &str = "0-0";

/// An entry delivered to a consumer but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Interface for the durable event log.
///
/// Implementations:
/// - `RedisEventLog`: Redis Streams
/// - `MockEventLog`: In-memory log for testing
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an entry and return its id.
    ///
    /// With `max_len`, the stream is trimmed to approximately that many
    /// entries, dropping the oldest.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String>;

    /// Create the consumer group (and the stream) if missing.
    ///
    /// A group that already exists is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read entries never delivered to any member of `group`.
    ///
    /// Blocks for up to `block` when nothing is available; returns an empty
    /// list on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Transfer entries pending longer than `min_idle` to `consumer`.
    ///
    /// Scans the pending list from `cursor` and returns at most `count`
    /// claimed entries.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<ClaimPage>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Pending entries of `group`, oldest first, at most `count`.
    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>>;

    /// Oldest entries of the stream, at most `count`.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;

    /// Read a single entry by id.
    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, stream: &str, id: &str) -> Result<bool>;

    /// Number of entries currently in the stream.
    async fn length(&self, stream: &str) -> Result<usize>;
}
