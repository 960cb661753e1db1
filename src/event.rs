//! Event records shared by the outbox, the stream and consumers.
//!
//! An [`OutboxRow`] is written by a producer inside its own transaction.
//! The dispatcher turns it into a stream entry whose fields are described
//! by [`fields`]; consumers decode that entry back into an [`Event`].

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stream entry field names.
pub mod fields {
    pub const EVENT_ID: &str = "eventId";
    pub const EVENT_TYPE: &str = "eventType";
    pub const PAYLOAD: &str = "payload";
    pub const OCCURRED_AT: &str = "occurredAt";
    /// Dead-letter only: last handler error.
    pub const ERROR: &str = "error";
    /// Dead-letter only: stream id of the entry that failed.
    pub const SOURCE_ENTRY_ID: &str = "sourceEntryId";
    /// Dead-letter only: failed attempts before dead-lettering.
    pub const ATTEMPTS: &str = "attempts";
    /// Dead-letter only: when the entry was dead-lettered.
    pub const FAILED_AT: &str = "failedAt";
}

/// Errors decoding a stream entry into an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid event id: {0}")]
    InvalidId(#[from] uuid::Error),

    #[error("Invalid payload JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Invalid occurredAt timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

/// Durable outbox record.
///
/// `published_at` is `None` until the dispatcher has appended the row to the
/// stream. Rows are never updated otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct OutboxRow {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    /// Materialize the event this row describes.
    pub fn to_event(&self) -> Event {
        Event {
            event_id: self.id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            occurred_at: self.created_at,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Event as seen by handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Encode as stream entry fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (fields::EVENT_ID.to_string(), self.event_id.to_string()),
            (fields::EVENT_TYPE.to_string(), self.event_type.clone()),
            (fields::PAYLOAD.to_string(), self.payload.to_string()),
            (fields::OCCURRED_AT.to_string(), format_timestamp(&self.occurred_at)),
        ]
    }

    /// Decode from stream entry fields. Unknown fields are ignored.
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let get = |name: &'static str| {
            map.get(name)
                .map(String::as_str)
                .ok_or(DecodeError::MissingField(name))
        };

        let event_id = Uuid::parse_str(get(fields::EVENT_ID)?)?;
        let event_type = get(fields::EVENT_TYPE)?.to_string();
        if event_type.is_empty() {
            return Err(DecodeError::MissingField(fields::EVENT_TYPE));
        }
        let payload = serde_json::from_str(get(fields::PAYLOAD)?)?;
        let occurred_at = parse_timestamp(get(fields::OCCURRED_AT)?)?;

        Ok(Self {
            event_id,
            event_type,
            payload,
            occurred_at,
        })
    }
}

/// ISO-8601 / RFC 3339 in UTC with millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "wallet.created".to_string(),
            payload: json!({"id": "w1", "owner": {"name": "ada"}}),
            occurred_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_event_fields_use_wire_names() {
        let event = sample_event();
        let encoded: HashMap<String, String> = event.to_fields().into_iter().collect();

        assert_eq!(encoded["eventId"], event.event_id.to_string());
        assert_eq!(encoded["eventType"], "wallet.created");
        assert_eq!(encoded["occurredAt"], "2024-03-01T12:30:00.000Z");

        let payload: Value = serde_json::from_str(&encoded["payload"]).unwrap();
        assert_eq!(payload["id"], "w1");
    }

    #[test]
    fn test_event_decodes_from_fields() {
        let event = sample_event();
        let encoded: HashMap<String, String> = event.to_fields().into_iter().collect();

        let decoded = Event::from_fields(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_ignores_dead_letter_fields() {
        let event = sample_event();
        let mut encoded: HashMap<String, String> = event.to_fields().into_iter().collect();
        encoded.insert(fields::ERROR.to_string(), "boom".to_string());

        assert!(Event::from_fields(&encoded).is_ok());
    }

    #[test]
    fn test_decode_missing_field() {
        let mut encoded: HashMap<String, String> = sample_event().to_fields().into_iter().collect();
        encoded.remove(fields::EVENT_TYPE);

        let err = Event::from_fields(&encoded).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("eventType")));
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let mut encoded: HashMap<String, String> = sample_event().to_fields().into_iter().collect();
        encoded.insert(fields::PAYLOAD.to_string(), "{not json".to_string());

        assert!(matches!(
            Event::from_fields(&encoded),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_outbox_row_to_event_uses_created_at() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let row = OutboxRow {
            id: Uuid::new_v4(),
            event_type: "account.opened".to_string(),
            payload: json!({"id": 7}),
            created_at,
            published_at: None,
        };

        let event = row.to_event();
        assert_eq!(event.event_id, row.id);
        assert_eq!(event.occurred_at, created_at);
        assert!(!row.is_published());
    }
}
