//! In-memory outbox store for testing.
//!
//! Emulates PostgreSQL row locking: rows held by an open [`ClaimedBatch`]
//! are invisible to other claims until the batch is committed or dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{validate_event_type, ClaimedBatch, OutboxError, OutboxRow, OutboxStore, Result};

#[derive(Default)]
struct MockState {
    rows: Vec<OutboxRow>,
    locked: HashSet<Uuid>,
    fail_on_claim: bool,
    fail_on_mark: bool,
    fail_on_purge: bool,
}

/// Mock outbox store that keeps rows in memory.
#[derive(Clone, Default)]
pub struct MockOutboxStore {
    state: Arc<Mutex<MockState>>,
}

impl MockOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Insert a row with an explicit creation time.
    pub fn insert_at(&self, event_type: &str, payload: Value, created_at: DateTime<Utc>) -> OutboxRow {
        let row = OutboxRow {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload,
            created_at,
            published_at: None,
        };
        self.state().rows.push(row.clone());
        row
    }

    /// Overwrite `published_at` for a row, bypassing claiming.
    pub fn set_published_at(&self, id: Uuid, published_at: Option<DateTime<Utc>>) {
        if let Some(row) = self.state().rows.iter_mut().find(|r| r.id == id) {
            row.published_at = published_at;
        }
    }

    pub fn set_fail_on_claim(&self, fail: bool) {
        self.state().fail_on_claim = fail;
    }

    pub fn set_fail_on_mark(&self, fail: bool) {
        self.state().fail_on_mark = fail;
    }

    pub fn set_fail_on_purge(&self, fail: bool) {
        self.state().fail_on_purge = fail;
    }

    /// Snapshot of all rows in insertion order.
    pub fn rows(&self) -> Vec<OutboxRow> {
        self.state().rows.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRow> {
        self.state().rows.iter().find(|r| r.id == id).cloned()
    }

    pub fn unpublished_count(&self) -> usize {
        self.state().rows.iter().filter(|r| !r.is_published()).count()
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panicking test must not poison the store for the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl OutboxStore for MockOutboxStore {
    async fn insert(&self, event_type: &str, payload: Value) -> Result<OutboxRow> {
        validate_event_type(event_type)?;
        Ok(self.insert_at(event_type, payload, Utc::now()))
    }

    async fn claim(&self, limit: u32) -> Result<Box<dyn ClaimedBatch>> {
        let mut state = self.state();
        if state.fail_on_claim {
            return Err(OutboxError::Unavailable("Mock claim failure".to_string()));
        }

        let mut candidates: Vec<OutboxRow> = state
            .rows
            .iter()
            .filter(|r| !r.is_published() && !state.locked.contains(&r.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.created_at);
        candidates.truncate(limit as usize);

        for row in &candidates {
            state.locked.insert(row.id);
        }

        Ok(Box::new(MockClaimedBatch {
            state: Arc::clone(&self.state),
            rows: candidates,
            marks: Vec::new(),
        }))
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        if state.fail_on_purge {
            return Err(OutboxError::Unavailable("Mock purge failure".to_string()));
        }
        let before = state.rows.len();
        state
            .rows
            .retain(|r| !matches!(r.published_at, Some(at) if at < cutoff));
        Ok((before - state.rows.len()) as u64)
    }
}

struct MockClaimedBatch {
    state: Arc<Mutex<MockState>>,
    rows: Vec<OutboxRow>,
    marks: Vec<(Uuid, DateTime<Utc>)>,
}

#[async_trait]
impl ClaimedBatch for MockClaimedBatch {
    fn rows(&self) -> &[OutboxRow] {
        &self.rows
    }

    async fn mark_published(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if lock(&self.state).fail_on_mark {
            return Err(OutboxError::Unavailable("Mock mark failure".to_string()));
        }
        if !self.rows.iter().any(|r| r.id == id) {
            return Err(OutboxError::NotClaimed(id));
        }
        self.marks.push((id, at));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        // Locks are released by Drop.
        let marks = std::mem::take(&mut self.marks);
        let mut state = lock(&self.state);
        for (id, at) in marks {
            if let Some(row) = state.rows.iter_mut().find(|r| r.id == id) {
                row.published_at = Some(at);
            }
        }
        Ok(())
    }
}

impl Drop for MockClaimedBatch {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for row in &self.rows {
            state.locked.remove(&row.id);
        }
    }
}
