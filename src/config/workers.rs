//! Dispatcher and consumer tuning.

use std::time::Duration;

use serde::Deserialize;

/// Outbox dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Run the dispatcher in this process.
    pub enabled: bool,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
    /// Rows claimed per tick.
    pub batch_size: u32,
    /// Published rows older than this are deleted.
    pub retention_days: u32,
    /// Minimum time between retention sweeps, in seconds.
    pub cleanup_cooldown_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            batch_size: 100,
            retention_days: 30,
            cleanup_cooldown_secs: 3600,
        }
    }
}

impl DispatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn cleanup_cooldown(&self) -> Duration {
        Duration::from_secs(self.cleanup_cooldown_secs)
    }
}

/// Stream consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Run the consumer in this process.
    pub enabled: bool,
    /// How long a group read blocks waiting for entries, in milliseconds.
    pub block_ms: u64,
    /// Entries per group read and per reclaim page.
    pub read_count: usize,
    /// Lifetime of idempotency markers and retry counters, in seconds.
    pub idempotency_ttl_secs: u64,
    /// Failed attempts before an entry is dead-lettered.
    pub max_retries: u64,
    /// Pending entries idle at least this long are reclaimed, in milliseconds.
    pub reclaim_idle_ms: u64,
    /// How often the reclaim pass runs, in milliseconds.
    pub reclaim_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_ms: 5000,
            read_count: 10,
            idempotency_ttl_secs: 86_400,
            max_retries: 10,
            reclaim_idle_ms: 60_000,
            reclaim_interval_ms: 60_000,
        }
    }
}

impl ConsumerConfig {
    /// Never zero: a non-blocking read would spin the consumer loop.
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms.max(1))
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}
