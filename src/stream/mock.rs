//! In-memory event log for testing.
//!
//! Implements the consumer-group semantics the consumer relies on: each
//! entry is delivered to one group member, stays in the pending list until
//! acknowledged, and can be claimed by another member once it has been idle
//! long enough.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    ClaimPage, EventLog, PendingEntry, Result, StreamEntry, StreamError, CLAIM_CURSOR_START,
};

/// Stream id as `(milliseconds, sequence)`.
type EntryId = (u64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(id: &str) -> Option<EntryId> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Default)]
struct StreamData {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl StreamData {
    fn next_id(&mut self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let id = if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }

    fn entry(&self, id: EntryId) -> Option<StreamEntry> {
        self.entries.get(&id).map(|fields| StreamEntry {
            id: format_id(id),
            fields: fields.clone(),
        })
    }
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, StreamData>,
    fail_on_append: bool,
    fail_on_read: bool,
    fail_on_ack: bool,
    fail_on_group: bool,
}

/// Mock event log that keeps streams in memory.
#[derive(Clone, Default)]
pub struct MockEventLog {
    state: Arc<Mutex<MockState>>,
    appended: Arc<Notify>,
}

impl MockEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test must not poison the log for the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_on_append(&self, fail: bool) {
        self.state().fail_on_append = fail;
    }

    pub fn set_fail_on_read(&self, fail: bool) {
        self.state().fail_on_read = fail;
    }

    pub fn set_fail_on_ack(&self, fail: bool) {
        self.state().fail_on_ack = fail;
    }

    /// Make `ensure_group` fail, as if the server were unreachable.
    pub fn set_fail_on_group(&self, fail: bool) {
        self.state().fail_on_group = fail;
    }

    /// Destroy a consumer group with its pending list, like `XGROUP DESTROY`.
    pub fn drop_group(&self, stream: &str, group: &str) -> bool {
        self.state()
            .streams
            .get_mut(stream)
            .is_some_and(|s| s.groups.remove(group).is_some())
    }

    /// Pretend every pending entry of `group` was delivered `by` earlier.
    pub fn age_pending(&self, stream: &str, group: &str, by: Duration) {
        let mut state = self.state();
        let Some(group) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return;
        };
        for info in group.pending.values_mut() {
            if let Some(earlier) = info.delivered_at.checked_sub(by) {
                info.delivered_at = earlier;
            }
        }
    }

    /// All entries of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.state()
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .keys()
                    .filter_map(|id| s.entry(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state();
        if state.fail_on_read {
            return Err(StreamError::Connection("Mock read failure".to_string()));
        }

        let no_group = || StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let data = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamData {
            entries, groups, ..
        } = data;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let mut delivered = Vec::new();
        for (id, fields) in entries
            .range((
                std::ops::Bound::Excluded(group_state.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
        {
            group_state.pending.insert(
                *id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            delivered.push(StreamEntry {
                id: format_id(*id),
                fields: fields.clone(),
            });
        }
        if let Some(last) = delivered.last().and_then(|e| parse_id(&e.id)) {
            group_state.last_delivered = last;
        }
        Ok(delivered)
    }
}

#[async_trait]
impl EventLog for MockEventLog {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let id = {
            let mut state = self.state();
            if state.fail_on_append {
                return Err(StreamError::Connection("Mock append failure".to_string()));
            }
            let data = state.streams.entry(stream.to_string()).or_default();
            let id = data.next_id();
            data.entries.insert(id, fields.iter().cloned().collect());
            if let Some(max_len) = max_len {
                while data.entries.len() > max_len {
                    data.entries.pop_first();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(format_id(id))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_on_group {
            return Err(StreamError::Connection("Mock group failure".to_string()));
        }
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read(stream, group, consumer, count)?;
            if !entries.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<ClaimPage> {
        let mut state = self.state();
        if state.fail_on_read {
            return Err(StreamError::Connection("Mock read failure".to_string()));
        }

        let no_group = || StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let data = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamData {
            entries, groups, ..
        } = data;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        let start = parse_id(cursor).unwrap_or_default();
        let now = Instant::now();
        let mut page = ClaimPage {
            next_cursor: CLAIM_CURSOR_START.to_string(),
            ..Default::default()
        };

        let candidates: Vec<EntryId> = group_state
            .pending
            .range(start..)
            .filter(|(_, info)| now.duration_since(info.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();

        for id in candidates {
            if page.entries.len() >= count {
                page.next_cursor = format_id(id);
                break;
            }
            match entries.get(&id) {
                Some(fields) => {
                    if let Some(info) = group_state.pending.get_mut(&id) {
                        info.consumer = consumer.to_string();
                        info.delivered_at = now;
                        info.deliveries += 1;
                    }
                    page.entries.push(StreamEntry {
                        id: format_id(id),
                        fields: fields.clone(),
                    });
                }
                None => {
                    group_state.pending.remove(&id);
                    page.deleted_ids.push(format_id(id));
                }
            }
        }

        Ok(page)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_on_ack {
            return Err(StreamError::Connection("Mock ack failure".to_string()));
        }
        if let (Some(group), Some(id)) = (
            state
                .streams
                .get_mut(stream)
                .and_then(|s| s.groups.get_mut(group)),
            parse_id(id),
        ) {
            group.pending.remove(&id);
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let state = self.state();
        let Some(group) = state.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Err(StreamError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };
        let now = Instant::now();
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(id, info)| PendingEntry {
                id: format_id(*id),
                consumer: info.consumer.clone(),
                idle: now.duration_since(info.delivered_at),
                deliveries: info.deliveries,
            })
            .collect())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let state = self.state();
        Ok(state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .keys()
                    .take(count)
                    .filter_map(|id| s.entry(*id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>> {
        let state = self.state();
        Ok(state
            .streams
            .get(stream)
            .zip(parse_id(id))
            .and_then(|(s, id)| s.entry(id)))
    }

    async fn delete(&self, stream: &str, id: &str) -> Result<bool> {
        let mut state = self.state();
        Ok(state
            .streams
            .get_mut(stream)
            .zip(parse_id(id))
            .map(|(s, id)| s.entries.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn length(&self, stream: &str) -> Result<usize> {
        let state = self.state();
        Ok(state.streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "internal.events";
    const GROUP: &str = "svc";

    fn fields(value: &str) -> Vec<(String, String)> {
        vec![("k".to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let log = MockEventLog::new();
        let a = log.append(STREAM, &fields("a"), None).await.unwrap();
        let b = log.append(STREAM, &fields("b"), None).await.unwrap();

        assert!(parse_id(&a).unwrap() < parse_id(&b).unwrap());
        assert_eq!(log.length(STREAM).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_trims_oldest() {
        let log = MockEventLog::new();
        for i in 0..5 {
            log.append(STREAM, &fields(&i.to_string()), Some(3))
                .await
                .unwrap();
        }

        let remaining = log.range(STREAM, 10).await.unwrap();
        let values: Vec<&str> = remaining.iter().map(|e| e.field("k").unwrap()).collect();
        assert_eq!(values, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_group_delivers_each_entry_once() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log.append(STREAM, &fields("a"), None).await.unwrap();

        let first = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let second = log
            .read_group(STREAM, GROUP, "c2", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let pending = log.pending(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
    }

    #[tokio::test]
    async fn test_group_created_late_sees_existing_entries() {
        let log = MockEventLog::new();
        log.append(STREAM, &fields("a"), None).await.unwrap();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let read = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let log = MockEventLog::new();
        let err = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_missing_group());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let reader = {
            let log = log.clone();
            tokio::spawn(async move {
                log.read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(STREAM, &fields("a"), None).await.unwrap();

        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let read = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        let id = log.append(STREAM, &fields("a"), None).await.unwrap();
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        log.ack(STREAM, GROUP, &id).await.unwrap();

        assert!(log.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_idle_respects_threshold() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log.append(STREAM, &fields("a"), None).await.unwrap();
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let fresh = log
            .claim_idle(STREAM, GROUP, "c2", Duration::from_secs(60), CLAIM_CURSOR_START, 10)
            .await
            .unwrap();
        assert!(fresh.entries.is_empty());

        log.age_pending(STREAM, GROUP, Duration::from_secs(61));
        let stale = log
            .claim_idle(STREAM, GROUP, "c2", Duration::from_secs(60), CLAIM_CURSOR_START, 10)
            .await
            .unwrap();
        assert_eq!(stale.entries.len(), 1);
        assert_eq!(stale.next_cursor, CLAIM_CURSOR_START);

        let pending = log.pending(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_claim_idle_drops_deleted_entries() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        let id = log.append(STREAM, &fields("a"), None).await.unwrap();
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        log.delete(STREAM, &id).await.unwrap();

        let page = log
            .claim_idle(STREAM, GROUP, "c2", Duration::ZERO, CLAIM_CURSOR_START, 10)
            .await
            .unwrap();

        assert!(page.entries.is_empty());
        assert_eq!(page.deleted_ids, vec![id]);
        assert!(log.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_idle_pages_with_cursor() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        for i in 0..3 {
            log.append(STREAM, &fields(&i.to_string()), None)
                .await
                .unwrap();
        }
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let first = log
            .claim_idle(STREAM, GROUP, "c2", Duration::ZERO, CLAIM_CURSOR_START, 2)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_ne!(first.next_cursor, CLAIM_CURSOR_START);

        let second = log
            .claim_idle(STREAM, GROUP, "c2", Duration::ZERO, &first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.next_cursor, CLAIM_CURSOR_START);
    }

    #[tokio::test]
    async fn test_dropped_group_reports_missing_group() {
        let log = MockEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        assert!(log.drop_group(STREAM, GROUP));

        let err = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_missing_group());
        assert!(!log.drop_group(STREAM, GROUP));
    }
}
