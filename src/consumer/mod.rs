//! Stream consumer.
//!
//! Reads the event stream through a consumer group named after the service,
//! so each entry goes to one instance of the service. For every entry:
//!
//! 1. decode the event (undecodable entries go straight to the dead-letter
//!    stream)
//! 2. set the idempotency marker for its event id, or ack and skip if it is
//!    already set
//! 3. run the registered handlers in order
//! 4. ack on success; on failure release the marker and count the attempt,
//!    leaving the entry pending until the retry limit dead-letters it
//!
//! Entries left pending (failures, or a crashed instance) are picked up by a
//! periodic reclaim pass once they have been idle long enough.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, ConsumerConfig};
use crate::dlq::{DeadLetter, DeadLetterQueue, DlqError};
use crate::event::Event;
use crate::handlers::{EventHandler, HandlerRegistry};
use crate::idempotency::{DeliveryTracker, TrackerError};
use crate::stream::{EventLog, StreamEntry, StreamError, CLAIM_CURSOR_START};
use crate::utils::log_dedup::ErrorLogGate;
use crate::utils::retry::{loop_backoff, LoopBackoff};

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors that interrupt processing of an entry.
///
/// Handler failures are not errors here; they become [`Outcome::Retrying`]
/// or [`Outcome::DeadLettered`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DlqError),
}

impl ConsumerError {
    /// Whether the same call may succeed once the backend recovers.
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Stream(e) => e.is_transient(),
            ConsumerError::Tracker(e) => e.is_transient(),
            ConsumerError::DeadLetter(DlqError::Stream(e)) => e.is_transient(),
            ConsumerError::DeadLetter(_) => false,
        }
    }

    fn is_missing_group(&self) -> bool {
        match self {
            ConsumerError::Stream(e) => e.is_missing_group(),
            ConsumerError::DeadLetter(DlqError::Stream(e)) => e.is_missing_group(),
            _ => false,
        }
    }
}

/// How a stream entry was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All handlers succeeded.
    Acked,
    /// The event id was already processed within the idempotency TTL.
    Duplicate,
    /// No handler is registered for the event type.
    Unroutable,
    /// A handler failed; the entry stays pending for another attempt.
    Retrying { attempts: u64 },
    /// A handler failed for the last allowed time.
    DeadLettered { attempts: u64 },
    /// A reclaimed entry had already been copied to the dead-letter stream
    /// but its ack was lost; it is acked without running handlers again.
    AlreadyDeadLettered,
    /// The entry could not be decoded into an event.
    Malformed,
}

/// Identity of one consumer within its group.
///
/// Format: `{service}-{hostname}-{pid}-{random6}`. The random suffix keeps
/// a restarted process with a recycled pid from inheriting the pending
/// entries of its predecessor's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn generate(service: &str) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{}-{}-{}-{}", service, host, std::process::id(), suffix))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Consumer group member for one service.
pub struct Consumer {
    log: Arc<dyn EventLog>,
    tracker: Arc<dyn DeliveryTracker>,
    registry: Arc<HandlerRegistry>,
    dlq: DeadLetterQueue,
    stream: String,
    group: String,
    id: ConsumerId,
    config: ConsumerConfig,
}

impl Consumer {
    /// Create a consumer in the group named after `config.service_name`.
    pub fn new(
        log: Arc<dyn EventLog>,
        tracker: Arc<dyn DeliveryTracker>,
        registry: Arc<HandlerRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            dlq: DeadLetterQueue::new(log.clone(), &config.stream),
            log,
            tracker,
            registry,
            stream: config.stream.name.clone(),
            group: config.service_name.clone(),
            id: ConsumerId::generate(&config.service_name),
            config: config.consumer.clone(),
        }
    }

    /// Replace the generated identity.
    pub fn with_id(mut self, id: ConsumerId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn start(&self) -> Result<()> {
        self.log.ensure_group(&self.stream, &self.group).await?;
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.id,
            event_types = ?self.registry.event_types(),
            "Consumer joined group"
        );
        Ok(())
    }

    /// Read and process one batch of new entries.
    pub async fn poll(&self) -> Result<Vec<Outcome>> {
        let entries = self.read().await?;
        self.process_batch(&entries).await
    }

    async fn read(&self) -> Result<Vec<StreamEntry>> {
        Ok(self
            .log
            .read_group(
                &self.stream,
                &self.group,
                self.id.as_str(),
                self.config.read_count,
                self.config.block(),
            )
            .await?)
    }

    /// Claim and process every entry idle past the reclaim threshold.
    pub async fn reclaim(&self) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        let mut cursor = CLAIM_CURSOR_START.to_string();
        loop {
            let page = self
                .log
                .claim_idle(
                    &self.stream,
                    &self.group,
                    self.id.as_str(),
                    self.config.reclaim_idle(),
                    &cursor,
                    self.config.read_count,
                )
                .await?;

            for id in &page.deleted_ids {
                warn!(entry_id = %id, "Pending entry no longer in stream, dropped");
                self.tracker.clear_failures(id).await?;
            }
            if !page.entries.is_empty() {
                debug!(count = page.entries.len(), "Reclaimed idle entries");
            }
            for entry in &page.entries {
                let span = info_span!("entry", entry_id = %entry.id, consumer = %self.id);
                outcomes.push(self.settle_reclaimed(entry).instrument(span).await?);
            }

            if page.next_cursor == CLAIM_CURSOR_START {
                return Ok(outcomes);
            }
            cursor = page.next_cursor;
        }
    }

    async fn settle_reclaimed(&self, entry: &StreamEntry) -> Result<Outcome> {
        if self.tracker.is_dead_lettered(&entry.id).await? {
            debug!("Entry already dead-lettered, acking");
            self.ack(entry).await?;
            self.tracker.clear_failures(&entry.id).await?;
            return Ok(Outcome::AlreadyDeadLettered);
        }
        self.process_entry(entry).await
    }

    async fn process_batch(&self, entries: &[StreamEntry]) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let span = info_span!("entry", entry_id = %entry.id, consumer = %self.id);
            outcomes.push(self.process_entry(entry).instrument(span).await?);
        }
        Ok(outcomes)
    }

    /// Settle one stream entry.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<Outcome> {
        let event = match Event::from_fields(&entry.fields) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable stream entry");
                self.dlq
                    .publish(&DeadLetter::new(entry, format!("Malformed entry: {e}"), 0))
                    .await?;
                self.ack(entry).await?;
                return Ok(Outcome::Malformed);
            }
        };

        let event_id = event.event_id.to_string();
        let ttl = self.config.idempotency_ttl();

        if !self.tracker.claim(&event_id, ttl).await? {
            debug!(event_id = %event_id, "Duplicate event, skipping");
            self.ack(entry).await?;
            return Ok(Outcome::Duplicate);
        }

        let handlers = self.registry.handlers(&event.event_type);
        if handlers.is_empty() {
            warn!(
                event_id = %event_id,
                event_type = %event.event_type,
                "No handler registered for event type"
            );
            self.ack(entry).await?;
            return Ok(Outcome::Unroutable);
        }

        match invoke(handlers, &event).await {
            Ok(()) => {
                self.ack(entry).await?;
                self.tracker.clear_failures(&entry.id).await?;
                debug!(event_id = %event_id, event_type = %event.event_type, "Event handled");
                Ok(Outcome::Acked)
            }
            Err(error) => self.fail(entry, &event, error).await,
        }
    }

    async fn fail(&self, entry: &StreamEntry, event: &Event, error: String) -> Result<Outcome> {
        let event_id = event.event_id.to_string();
        self.tracker.release(&event_id).await?;
        let attempts = self
            .tracker
            .record_failure(&entry.id, self.config.idempotency_ttl())
            .await?;

        if attempts < self.config.max_retries {
            warn!(
                event_id = %event_id,
                event_type = %event.event_type,
                attempts,
                max_retries = self.config.max_retries,
                error = %error,
                "Handler failed, entry left pending for retry"
            );
            return Ok(Outcome::Retrying { attempts });
        }

        error!(
            event_id = %event_id,
            event_type = %event.event_type,
            attempts,
            error = %error,
            "Retries exhausted"
        );
        self.dlq
            .publish(&DeadLetter::new(entry, error, attempts))
            .await?;
        // Set before the ack: if the ack is lost, the next reclaim only acks.
        self.tracker
            .mark_dead_lettered(&entry.id, self.config.idempotency_ttl())
            .await?;
        self.ack(entry).await?;
        self.tracker.clear_failures(&entry.id).await?;
        Ok(Outcome::DeadLettered { attempts })
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<()> {
        self.log.ack(&self.stream, &self.group, &entry.id).await?;
        Ok(())
    }

    /// Read, process and reclaim until `token` is cancelled.
    ///
    /// Errors never end the loop: they are logged once per distinct message
    /// and followed by a pause. Transient errors back off exponentially;
    /// anything else waits the full backoff cap, since retrying sooner will
    /// not help. Cancellation interrupts a blocking read or a pause, never a
    /// batch being processed.
    pub async fn run(self, token: CancellationToken) {
        let mut backoff = LoopBackoff::new(loop_backoff(), Duration::from_secs(5));
        let mut gate = ErrorLogGate::new("consumer");
        let mut joined = false;
        // Reclaim right away: a restarted instance may have entries to finish.
        let mut next_reclaim = Instant::now();

        while !token.is_cancelled() {
            let result = if !joined {
                self.start().await.map(|()| {
                    joined = true;
                })
            } else if Instant::now() >= next_reclaim {
                next_reclaim = Instant::now() + self.config.reclaim_interval();
                self.reclaim().await.map(|_| ())
            } else {
                let read = tokio::select! {
                    _ = token.cancelled() => break,
                    read = self.read() => read,
                };
                match read {
                    Ok(entries) => self.process_batch(&entries).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    gate.recovered();
                    backoff.reset();
                }
                Err(e) => {
                    if e.is_missing_group() {
                        joined = false;
                    }
                    let delay = if e.is_transient() {
                        gate.report_transient(e.to_string());
                        backoff.next_delay()
                    } else {
                        gate.report(e.to_string());
                        backoff.max_delay()
                    };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(consumer = %self.id, "Consumer stopped");
    }
}

/// Run handlers in order, stopping at the first failure.
async fn invoke(
    handlers: &[Arc<dyn EventHandler>],
    event: &Event,
) -> std::result::Result<(), String> {
    for handler in handlers {
        handler
            .handle(event)
            .await
            .map_err(|e| format!("{}: {}", handler.name(), e))?;
    }
    Ok(())
}
