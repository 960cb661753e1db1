//! Dead-letter stream.
//!
//! Entries that exhausted their retries, or that could never be decoded,
//! are appended to a separate stream together with the failure details.
//! Nothing consumes that stream automatically; operators inspect it and
//! replay or discard entries by hand.
//!
//! ## Entry Format
//!
//! A dead-letter entry carries every field of the failed entry unchanged
//! (`eventId`, `eventType`, `payload`, `occurredAt`) plus:
//! - `error`: the last failure message
//! - `sourceEntryId`: stream id of the failed entry
//! - `attempts`: failed attempts before dead-lettering
//! - `failedAt`: when it was dead-lettered
//!
//! ## Replay
//!
//! ```ignore
//! let dlq = DeadLetterQueue::new(log, &config.stream);
//! for entry in dlq.list(20).await? {
//!     println!("{} {}", entry.id, entry.dead_letter.error);
//! }
//! dlq.replay("1718000000000-0").await?;
//! ```
//!
//! Replay appends the original event (same `eventId`) to the main stream.
//! The consumer released the idempotency marker when the event failed, so
//! the replayed entry runs its handlers again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::event::{fields, format_timestamp, parse_timestamp, DecodeError, Event};
use crate::stream::{EventLog, StreamEntry, StreamError};

/// Result type for dead-letter operations.
pub type Result<T> = std::result::Result<T, DlqError>;

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Dead letter not found: {0}")]
    NotFound(String),

    #[error("Invalid dead letter: {0}")]
    InvalidDeadLetter(String),

    #[error("Dead letter {id} does not hold a valid event: {source}")]
    NotReplayable {
        id: String,
        #[source]
        source: DecodeError,
    },
}

const DEAD_LETTER_FIELDS: [&str; 4] = [
    fields::ERROR,
    fields::SOURCE_ENTRY_ID,
    fields::ATTEMPTS,
    fields::FAILED_AT,
];

/// A failed stream entry plus why it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Fields of the failed entry, verbatim.
    pub original: BTreeMap<String, String>,
    pub error: String,
    pub source_entry_id: String,
    pub attempts: u64,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for a stream entry that failed `attempts` times.
    pub fn new(source: &StreamEntry, error: impl Into<String>, attempts: u64) -> Self {
        Self {
            original: source
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            error: error.into(),
            source_entry_id: source.id.clone(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// The original event, if the failed entry held a valid one.
    pub fn event(&self) -> std::result::Result<Event, DecodeError> {
        let map: HashMap<String, String> = self
            .original
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Event::from_fields(&map)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.original.get(fields::EVENT_ID).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.original.get(fields::EVENT_TYPE).map(String::as_str)
    }

    /// Encode as dead-letter stream fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .original
            .iter()
            .filter(|(k, _)| !DEAD_LETTER_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.push((fields::ERROR.to_string(), self.error.clone()));
        out.push((fields::SOURCE_ENTRY_ID.to_string(), self.source_entry_id.clone()));
        out.push((fields::ATTEMPTS.to_string(), self.attempts.to_string()));
        out.push((fields::FAILED_AT.to_string(), format_timestamp(&self.failed_at)));
        out
    }

    /// Decode a dead-letter stream entry.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let get = |name: &str| {
            entry.field(name).ok_or_else(|| {
                DlqError::InvalidDeadLetter(format!("{}: missing field '{}'", entry.id, name))
            })
        };

        let error = get(fields::ERROR)?.to_string();
        let source_entry_id = get(fields::SOURCE_ENTRY_ID)?.to_string();
        let attempts = get(fields::ATTEMPTS)?.parse().map_err(|e| {
            DlqError::InvalidDeadLetter(format!("{}: bad attempts: {}", entry.id, e))
        })?;
        let failed_at = parse_timestamp(get(fields::FAILED_AT)?).map_err(|e| {
            DlqError::InvalidDeadLetter(format!("{}: bad failedAt: {}", entry.id, e))
        })?;

        let original = entry
            .fields
            .iter()
            .filter(|(k, _)| !DEAD_LETTER_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            original,
            error,
            source_entry_id,
            attempts,
            failed_at,
        })
    }
}

/// A dead letter together with its id in the dead-letter stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: String,
    pub dead_letter: DeadLetter,
}

/// Reads and writes the dead-letter stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    log: Arc<dyn EventLog>,
    stream: String,
    dead_letter_stream: String,
    max_len: Option<usize>,
}

impl DeadLetterQueue {
    pub fn new(log: Arc<dyn EventLog>, config: &StreamConfig) -> Self {
        Self {
            log,
            stream: config.name.clone(),
            dead_letter_stream: config.dead_letter_name.clone(),
            max_len: config.max_len(),
        }
    }

    /// Name of the dead-letter stream.
    pub fn stream_name(&self) -> &str {
        &self.dead_letter_stream
    }

    /// Append a dead letter. Returns its id in the dead-letter stream.
    pub async fn publish(&self, dead_letter: &DeadLetter) -> Result<String> {
        let id = self
            .log
            .append(&self.dead_letter_stream, &dead_letter.to_fields(), None)
            .await?;
        warn!(
            stream = %self.dead_letter_stream,
            dead_letter_id = %id,
            source_entry_id = %dead_letter.source_entry_id,
            event_id = dead_letter.event_id().unwrap_or_default(),
            attempts = dead_letter.attempts,
            error = %dead_letter.error,
            "Dead-lettered stream entry"
        );
        Ok(id)
    }

    /// Oldest dead letters first, at most `count`.
    ///
    /// Entries that are not valid dead letters are skipped with a warning.
    pub async fn list(&self, count: usize) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.log.range(&self.dead_letter_stream, count).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match DeadLetter::from_entry(&entry) {
                Ok(dead_letter) => out.push(DeadLetterEntry {
                    id: entry.id,
                    dead_letter,
                }),
                Err(e) => warn!(id = %entry.id, error = %e, "Skipping invalid dead letter"),
            }
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<DeadLetter> {
        let entry = self
            .log
            .get(&self.dead_letter_stream, id)
            .await?
            .ok_or_else(|| DlqError::NotFound(id.to_string()))?;
        DeadLetter::from_entry(&entry)
    }

    /// Re-append the original event to the main stream and delete the dead
    /// letter. Returns the new main-stream entry id.
    pub async fn replay(&self, id: &str) -> Result<String> {
        let dead_letter = self.get(id).await?;
        let event = dead_letter.event().map_err(|source| DlqError::NotReplayable {
            id: id.to_string(),
            source,
        })?;

        let new_id = self
            .log
            .append(&self.stream, &event.to_fields(), self.max_len)
            .await?;
        self.log.delete(&self.dead_letter_stream, id).await?;

        info!(
            dead_letter_id = %id,
            entry_id = %new_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Replayed dead letter"
        );
        Ok(new_id)
    }

    /// Delete a dead letter without replaying it.
    pub async fn discard(&self, id: &str) -> Result<()> {
        if !self.log.delete(&self.dead_letter_stream, id).await? {
            return Err(DlqError::NotFound(id.to_string()));
        }
        info!(dead_letter_id = %id, "Discarded dead letter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MockEventLog;
    use serde_json::json;
    use uuid::Uuid;

    fn stream_config() -> StreamConfig {
        StreamConfig {
            name: "internal.events".to_string(),
            dead_letter_name: "internal.events.dlq".to_string(),
            trim_max_len: 0,
        }
    }

    fn failed_entry() -> (Event, StreamEntry) {
        let event = Event {
            event_id: Uuid::new_v4(),
            event_type: "wallet.created".to_string(),
            payload: json!({"walletId": "w1"}),
            occurred_at: Utc::now(),
        };
        let entry = StreamEntry {
            id: "1700000000000-0".to_string(),
            fields: event.to_fields().into_iter().collect(),
        };
        (event, entry)
    }

    #[test]
    fn test_dead_letter_keeps_original_fields() {
        let (event, entry) = failed_entry();
        let dead_letter = DeadLetter::new(&entry, "provider timeout", 10);

        let encoded = StreamEntry {
            id: "1-0".to_string(),
            fields: dead_letter.to_fields().into_iter().collect(),
        };
        let decoded = DeadLetter::from_entry(&encoded).unwrap();

        assert_eq!(decoded.error, "provider timeout");
        assert_eq!(decoded.source_entry_id, "1700000000000-0");
        assert_eq!(decoded.attempts, 10);
        assert_eq!(decoded.event().unwrap().event_id, event.event_id);
    }

    #[test]
    fn test_malformed_source_is_not_an_event() {
        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: HashMap::from([("junk".to_string(), "x".to_string())]),
        };
        let dead_letter = DeadLetter::new(&entry, "missing eventId", 0);

        assert!(dead_letter.event().is_err());
        assert_eq!(dead_letter.event_id(), None);
    }

    #[test]
    fn test_from_entry_requires_error_field() {
        let (_, entry) = failed_entry();
        let err = DeadLetter::from_entry(&entry).unwrap_err();
        assert!(matches!(err, DlqError::InvalidDeadLetter(_)));
    }

    #[tokio::test]
    async fn test_replay_reappends_same_event_id() {
        let log = Arc::new(MockEventLog::new());
        let dlq = DeadLetterQueue::new(log.clone(), &stream_config());
        let (event, entry) = failed_entry();
        let dlq_id = dlq
            .publish(&DeadLetter::new(&entry, "boom", 3))
            .await
            .unwrap();

        let listed = dlq.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, dlq_id);

        dlq.replay(&dlq_id).await.unwrap();

        let main = log.entries("internal.events");
        assert_eq!(main.len(), 1);
        let replayed = Event::from_fields(&main[0].fields).unwrap();
        assert_eq!(replayed.event_id, event.event_id);
        assert!(dlq.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_rejects_malformed_dead_letter() {
        let log = Arc::new(MockEventLog::new());
        let dlq = DeadLetterQueue::new(log.clone(), &stream_config());
        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: HashMap::from([("junk".to_string(), "x".to_string())]),
        };
        let dlq_id = dlq
            .publish(&DeadLetter::new(&entry, "undecodable", 0))
            .await
            .unwrap();

        let err = dlq.replay(&dlq_id).await.unwrap_err();

        assert!(matches!(err, DlqError::NotReplayable { .. }));
        assert_eq!(dlq.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discard_missing_is_not_found() {
        let log = Arc::new(MockEventLog::new());
        let dlq = DeadLetterQueue::new(log, &stream_config());

        let err = dlq.discard("1-0").await.unwrap_err();
        assert!(matches!(err, DlqError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_discard_removes_entry() {
        let log = Arc::new(MockEventLog::new());
        let dlq = DeadLetterQueue::new(log, &stream_config());
        let (_, entry) = failed_entry();
        let id = dlq
            .publish(&DeadLetter::new(&entry, "boom", 1))
            .await
            .unwrap();

        dlq.discard(&id).await.unwrap();

        assert!(dlq.list(10).await.unwrap().is_empty());
    }
}
