//! Redis Streams integration tests using testcontainers.
//!
//! Run with: cargo test --test stream_redis -- --ignored --nocapture

mod containers;

use std::time::Duration;

use tokio_test::assert_ok;

use ferry::idempotency::{DeliveryTracker, RedisDeliveryTracker};
use ferry::stream::{EventLog, RedisClient, RedisEventLog, CLAIM_CURSOR_START};

const STREAM: &str = "internal.events";
const GROUP: &str = "wallets";

fn fields(value: &str) -> Vec<(String, String)> {
    vec![("eventId".to_string(), value.to_string())]
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_consumer_group_lifecycle() {
    let (_container, url) = containers::start_redis().await;
    let client = RedisClient::connect(&url).await.unwrap();
    let log = RedisEventLog::new(&client).await.unwrap();

    let first = log.append(STREAM, &fields("a"), Some(1000)).await.unwrap();
    // Group created after the first append still sees it.
    assert_ok!(log.ensure_group(STREAM, GROUP).await);
    assert_ok!(log.ensure_group(STREAM, GROUP).await);
    log.append(STREAM, &fields("b"), None).await.unwrap();
    assert_eq!(log.length(STREAM).await.unwrap(), 2);

    let read = log
        .read_group(STREAM, GROUP, "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].id, first);
    assert_eq!(read[0].field("eventId"), Some("a"));

    let empty = log
        .read_group(STREAM, GROUP, "c2", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_empty());

    let pending = log.pending(STREAM, GROUP, 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].consumer, "c1");
    assert_eq!(pending[0].deliveries, 1);

    log.ack(STREAM, GROUP, &first).await.unwrap();
    assert_eq!(log.pending(STREAM, GROUP, 10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_claim_idle_transfers_ownership() {
    let (_container, url) = containers::start_redis().await;
    let client = RedisClient::connect(&url).await.unwrap();
    let log = RedisEventLog::new(&client).await.unwrap();
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

    tokio::time::sleep(Duration::from_millis(200)).await;
    let page = log
        .claim_idle(STREAM, GROUP, "c2", Duration::from_millis(100), CLAIM_CURSOR_START, 10)
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.next_cursor, CLAIM_CURSOR_START);

    let pending = log.pending(STREAM, GROUP, 10).await.unwrap();
    assert_eq!(pending[0].consumer, "c2");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_get_and_delete() {
    let (_container, url) = containers::start_redis().await;
    let client = RedisClient::connect(&url).await.unwrap();
    let log = RedisEventLog::new(&client).await.unwrap();
    let id = log.append(STREAM, &fields("a"), None).await.unwrap();

    let entry = log.get(STREAM, &id).await.unwrap().unwrap();
    assert_eq!(entry.field("eventId"), Some("a"));

    assert!(log.delete(STREAM, &id).await.unwrap());
    assert!(!log.delete(STREAM, &id).await.unwrap());
    assert!(log.get(STREAM, &id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_delivery_tracker() {
    let (_container, url) = containers::start_redis().await;
    let client = RedisClient::connect(&url).await.unwrap();
    let tracker = RedisDeliveryTracker::new(&client, "wallets");
    let ttl = Duration::from_secs(60);

    assert!(tracker.claim("e1", ttl).await.unwrap());
    assert!(!tracker.claim("e1", ttl).await.unwrap());
    tracker.release("e1").await.unwrap();
    assert!(tracker.claim("e1", ttl).await.unwrap());

    assert_eq!(tracker.record_failure("1-0", ttl).await.unwrap(), 1);
    assert_eq!(tracker.record_failure("1-0", ttl).await.unwrap(), 2);
    tracker.clear_failures("1-0").await.unwrap();
    assert_eq!(tracker.record_failure("1-0", ttl).await.unwrap(), 1);

    assert!(!tracker.is_dead_lettered("1-0").await.unwrap());
    tracker.mark_dead_lettered("1-0", ttl).await.unwrap();
    assert!(tracker.is_dead_lettered("1-0").await.unwrap());
    tracker.clear_failures("1-0").await.unwrap();
    assert!(!tracker.is_dead_lettered("1-0").await.unwrap());

    // Markers are namespaced per service.
    let other = RedisDeliveryTracker::new(&client, "ledger");
    assert!(other.claim("e1", ttl).await.unwrap());
}
