//! In-memory delivery tracker for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{DeliveryTracker, Result, TrackerError};

#[derive(Default)]
struct MockState {
    markers: HashMap<String, Instant>,
    failures: HashMap<String, (u64, Instant)>,
    dead_lettered: HashMap<String, Instant>,
    fail_all: bool,
}

/// Mock tracker with TTL expiry evaluated lazily on access.
#[derive(Clone, Default)]
pub struct MockDeliveryTracker {
    state: Arc<Mutex<MockState>>,
}

impl MockDeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call fail, as if the backend were unreachable.
    pub fn set_fail_all(&self, fail: bool) {
        self.state().fail_all = fail;
    }

    /// Whether a live marker exists for `event_id`.
    pub fn is_marked(&self, event_id: &str) -> bool {
        let now = Instant::now();
        self.state()
            .markers
            .get(event_id)
            .is_some_and(|expires| *expires > now)
    }

    /// Current failure count for a stream entry.
    pub fn failures(&self, entry_id: &str) -> u64 {
        let now = Instant::now();
        self.state()
            .failures
            .get(entry_id)
            .filter(|(_, expires)| *expires > now)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    fn check(state: &MockState) -> Result<()> {
        if state.fail_all {
            return Err(TrackerError::Unavailable("Mock tracker failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryTracker for MockDeliveryTracker {
    async fn claim(&self, event_id: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        Self::check(&state)?;
        let now = Instant::now();
        if state
            .markers
            .get(event_id)
            .is_some_and(|expires| *expires > now)
        {
            return Ok(false);
        }
        state.markers.insert(event_id.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        state.markers.remove(event_id);
        Ok(())
    }

    async fn record_failure(&self, entry_id: &str, ttl: Duration) -> Result<u64> {
        let mut state = self.state();
        Self::check(&state)?;
        let now = Instant::now();
        let entry = state
            .failures
            .entry(entry_id.to_string())
            .or_insert((0, now));
        if entry.1 <= now && entry.0 > 0 {
            entry.0 = 0;
        }
        entry.0 += 1;
        entry.1 = now + ttl;
        Ok(entry.0)
    }

    async fn mark_dead_lettered(&self, entry_id: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        state
            .dead_lettered
            .insert(entry_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn is_dead_lettered(&self, entry_id: &str) -> Result<bool> {
        let state = self.state();
        Self::check(&state)?;
        let now = Instant::now();
        Ok(state
            .dead_lettered
            .get(entry_id)
            .is_some_and(|expires| *expires > now))
    }

    async fn clear_failures(&self, entry_id: &str) -> Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        state.failures.remove(entry_id);
        state.dead_lettered.remove(entry_id);
        Ok(())
    }
}
