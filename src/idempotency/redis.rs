//! Redis delivery tracker.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{dead_letter_key, idempotency_key, retry_key, DeliveryTracker, Result};
use crate::stream::RedisClient;

/// Redis expirations are whole seconds; never round down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Delivery tracker backed by Redis keys.
pub struct RedisDeliveryTracker {
    conn: ConnectionManager,
    service: String,
}

impl RedisDeliveryTracker {
    /// Create a tracker whose keys are prefixed with `service`.
    pub fn new(client: &RedisClient, service: impl Into<String>) -> Self {
        Self {
            conn: client.connection(),
            service: service.into(),
        }
    }
}

#[async_trait]
impl DeliveryTracker for RedisDeliveryTracker {
    async fn claim(&self, event_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = idempotency_key(&self.service, event_id);
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        debug!(key = %key, claimed = set.is_some(), "Idempotency marker");
        Ok(set.is_some())
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(idempotency_key(&self.service, event_id)).await?;
        Ok(())
    }

    async fn record_failure(&self, entry_id: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = retry_key(&self.service, entry_id);
        let (attempts,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(attempts)
    }

    async fn mark_dead_lettered(&self, entry_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = conn
            .set_ex(dead_letter_key(&self.service, entry_id), "1", ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn is_dead_lettered(&self, entry_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(dead_letter_key(&self.service, entry_id)).await?;
        Ok(exists)
    }

    async fn clear_failures(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys = [
            retry_key(&self.service, entry_id),
            dead_letter_key(&self.service, entry_id),
        ];
        let _: i64 = conn.del(&keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }
}
