//! Outbox dispatcher.
//!
//! Polls the outbox on a fixed interval, appends unpublished rows to the
//! event stream in creation order and marks them published. Any number of
//! dispatchers may run against the same database: row locks taken by the
//! claim keep their batches disjoint.
//!
//! Delivery is at-least-once. A crash (or a failed mark/commit) after an
//! append leaves the row unpublished, and the next tick appends it again
//! under the same event id.
//!
//! When a tick finds nothing to publish, published rows older than the
//! retention window are deleted, at most once per cooldown period.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DispatcherConfig, StreamConfig};
use crate::outbox::{OutboxError, OutboxStore};
use crate::stream::{EventLog, StreamError};
use crate::utils::log_dedup::ErrorLogGate;

/// Errors from one dispatch cycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

impl DispatchError {
    /// Whether the next tick may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Outbox(e) => e.is_transient(),
            DispatchError::Stream(e) => e.is_transient(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rows claimed from the outbox.
    pub claimed: usize,
    /// Rows appended and marked published.
    pub published: usize,
    /// Rows deleted by the retention sweep.
    pub purged: u64,
}

/// Moves outbox rows onto the event stream.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    log: Arc<dyn EventLog>,
    stream: String,
    max_len: Option<usize>,
    config: DispatcherConfig,
    last_cleanup: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        log: Arc<dyn EventLog>,
        stream: &StreamConfig,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            log,
            stream: stream.name.clone(),
            max_len: stream.max_len(),
            config,
            last_cleanup: None,
        }
    }

    /// Run a single claim → append → mark → commit cycle.
    ///
    /// The first failure ends the cycle. If an append fails, rows already
    /// appended in this cycle stay marked; if a mark or the commit fails,
    /// the whole batch is rolled back.
    pub async fn run_once(&mut self) -> Result<DispatchReport, DispatchError> {
        let mut batch = self.store.claim(self.config.batch_size).await?;
        let rows = batch.rows().to_vec();
        let mut report = DispatchReport {
            claimed: rows.len(),
            ..Default::default()
        };

        if rows.is_empty() {
            batch.commit().await?;
            report.purged = self.purge_if_due().await?;
            return Ok(report);
        }

        for row in &rows {
            let fields = row.to_event().to_fields();
            let entry_id = match self.log.append(&self.stream, &fields, self.max_len).await {
                Ok(entry_id) => entry_id,
                Err(e) => {
                    if report.published > 0 {
                        if let Err(commit_err) = batch.commit().await {
                            error!(error = %commit_err, "Failed to commit partial batch");
                        }
                    }
                    return Err(e.into());
                }
            };
            batch.mark_published(row.id, Utc::now()).await?;
            report.published += 1;
            debug!(
                event_id = %row.id,
                event_type = %row.event_type,
                entry_id = %entry_id,
                "Dispatched outbox row"
            );
        }

        batch.commit().await?;
        Ok(report)
    }

    async fn purge_if_due(&mut self) -> Result<u64, DispatchError> {
        let cooldown = self.config.cleanup_cooldown();
        if self
            .last_cleanup
            .is_some_and(|last| last.elapsed() < cooldown)
        {
            return Ok(0);
        }

        let cutoff = Utc::now() - self.config.retention();
        let purged = self.store.purge_published_before(cutoff).await?;
        // A failed sweep is retried on the next idle tick.
        self.last_cleanup = Some(Instant::now());
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged published outbox rows");
        }
        Ok(purged)
    }

    /// Tick until `token` is cancelled.
    ///
    /// A cycle in progress when cancellation arrives runs to completion.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gate = ErrorLogGate::new("dispatcher");

        info!(
            stream = %self.stream,
            interval_ms = self.config.interval_ms,
            batch_size = self.config.batch_size,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(report) => {
                    gate.recovered();
                    if report.published > 0 {
                        debug!(
                            claimed = report.claimed,
                            published = report.published,
                            "Dispatch cycle complete"
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    gate.report_transient(e.to_string());
                }
                Err(e) => {
                    gate.report(e.to_string());
                }
            }
        }

        info!("Dispatcher stopped");
    }
}
