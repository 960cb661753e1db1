//! Test utilities shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::event::Event;
use crate::handlers::{EventHandler, HandlerError};
use crate::stream::StreamEntry;

/// Build an event with a fresh id.
pub fn make_event(event_type: &str, payload: Value) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        payload,
        occurred_at: Utc::now(),
    }
}

/// Wrap an event as a stream entry with the given id.
pub fn make_entry(id: &str, event: &Event) -> StreamEntry {
    StreamEntry {
        id: id.to_string(),
        fields: event.to_fields().into_iter().collect(),
    }
}

/// Handler that records the events it sees and can be told to fail.
pub struct RecordingHandler {
    event_type: String,
    name: String,
    seen: Arc<Mutex<Vec<Uuid>>>,
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            name: event_type.to_string(),
            seen: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fail the next `n` calls.
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call.
    pub fn always_failing(self) -> Self {
        self.failing(usize::MAX)
    }

    /// Shared call counter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared list of handled event ids, in call order.
    pub fn seen(&self) -> Arc<Mutex<Vec<Uuid>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(event.event_id);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(HandlerError::failed("provider unavailable"));
        }
        Ok(())
    }
}
