//! Connection and stream naming configuration.

use serde::Deserialize;

/// PostgreSQL connection for the outbox table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/ferry".to_string(),
            max_connections: 10,
        }
    }
}

/// Redis connection for the stream and delivery bookkeeping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Stream names and trimming.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Main event stream.
    pub name: String,
    /// Dead-letter stream.
    pub dead_letter_name: String,
    /// Approximate length cap applied on append. 0 disables trimming.
    pub trim_max_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "internal.events".to_string(),
            dead_letter_name: "internal.events.dlq".to_string(),
            trim_max_len: 1_000_000,
        }
    }
}

impl StreamConfig {
    pub fn max_len(&self) -> Option<usize> {
        (self.trim_max_len > 0).then_some(self.trim_max_len)
    }
}
