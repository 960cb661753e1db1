//! Redis Streams event log.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamMaxlen, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client, FromRedisValue};
use tracing::{debug, info, warn};

use super::{ClaimPage, EventLog, PendingEntry, Result, StreamEntry, StreamError};
use crate::utils::retry::connection_backoff;

/// Shared Redis connection handle.
///
/// Holds the client and one multiplexed [`ConnectionManager`] that every
/// component clones. Blocking reads get their own connection from
/// [`RedisClient::dedicated`] so they never stall other commands.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect, retrying with exponential backoff while Redis is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = Self::open_manager(&client).await?;

        info!(url = %url, "Connected to Redis");

        Ok(Self { client, conn })
    }

    async fn open_manager(client: &Client) -> Result<ConnectionManager> {
        let conn = (|| async { ConnectionManager::new(client.clone()).await })
            .retry(connection_backoff())
            .notify(|err: &redis::RedisError, dur: Duration| {
                warn!(
                    error = %err,
                    delay_ms = dur.as_millis(),
                    "Redis connection failed, retrying after backoff"
                );
            })
            .await?;
        Ok(conn)
    }

    /// The shared multiplexed connection.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// A new connection reserved for blocking commands.
    pub async fn dedicated(&self) -> Result<ConnectionManager> {
        Self::open_manager(&self.client).await
    }
}

/// Event log backed by Redis Streams.
pub struct RedisEventLog {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisEventLog {
    pub async fn new(client: &RedisClient) -> Result<Self> {
        Ok(Self {
            conn: client.connection(),
            blocking: client.dedicated().await?,
        })
    }
}

fn to_entry(id: StreamId) -> Result<StreamEntry> {
    let mut fields = HashMap::with_capacity(id.map.len());
    for (name, value) in id.map {
        let value = String::from_redis_value(&value)?;
        fields.insert(name, value);
    }
    Ok(StreamEntry { id: id.id, fields })
}

/// Pair up a flat `[field, value, field, value, ...]` list.
fn pair_fields(id: String, flat: Vec<String>) -> Result<StreamEntry> {
    if flat.len() % 2 != 0 {
        return Err(StreamError::UnexpectedReply(format!(
            "odd field list for entry {id}"
        )));
    }
    let mut fields = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        fields.insert(name, value);
    }
    Ok(StreamEntry { id, fields })
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = match max_len {
            Some(max_len) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", fields)
                    .await?
            }
            None => conn.xadd(stream, "*", fields).await?,
        };
        debug!(stream, id = %id, "Appended stream entry");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // "0" so a group created after the first append still sees it.
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => {
                info!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 waits forever; a zero duration means "don't block".
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.blocking.clone();
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                entries.push(to_entry(id)?);
            }
        }
        Ok(entries)
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
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut parts = reply.into_iter();
        let next_cursor = match parts.next() {
            Some(value) => String::from_redis_value(&value)?,
            None => {
                return Err(StreamError::UnexpectedReply(
                    "empty XAUTOCLAIM reply".to_string(),
                ))
            }
        };
        // Servers before 7.0 report deleted entries as nil in the entry list.
        let raw_entries: Vec<Option<(String, Vec<String>)>> = match parts.next() {
            Some(value) => FromRedisValue::from_redis_value(&value)?,
            None => Vec::new(),
        };
        let deleted_ids: Vec<String> = match parts.next() {
            Some(value) => FromRedisValue::from_redis_value(&value)?,
            None => Vec::new(),
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (id, flat) in raw_entries.into_iter().flatten() {
            entries.push(pair_fields(id, flat)?);
        }

        Ok(ClaimPage {
            next_cursor,
            entries,
            deleted_ids,
        })
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, "-", "+", count).await?;
        reply.ids.into_iter().map(to_entry).collect()
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, id, id, 1).await?;
        reply.ids.into_iter().next().map(to_entry).transpose()
    }

    async fn delete(&self, stream: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.xdel(stream, &[id]).await?;
        Ok(removed > 0)
    }

    async fn length(&self, stream: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.xlen(stream).await?;
        Ok(len)
    }
}
