//! Background roles of a host service.
//!
//! A [`Ferry`] owns the dispatcher and the consumer, each on its own task.
//! Which of them run is decided by configuration, so the same binary can be
//! deployed as dispatcher-only, consumer-only or both.
//!
//! ```ignore
//! let registry = HandlerRegistry::builder()
//!     .register(CreateWalletAddress::new(provider))
//!     .build();
//! let handle = Ferry::connect(config, registry).await?.spawn();
//! // ...
//! handle.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::consumer::Consumer;
use crate::dispatcher::Dispatcher;
use crate::handlers::HandlerRegistry;
use crate::idempotency::DeliveryTracker;
use crate::outbox::{OutboxError, OutboxStore};
use crate::stream::{EventLog, StreamError};

/// Errors assembling the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{role} is enabled but no {dependency} was provided")]
    Missing {
        role: &'static str,
        dependency: &'static str,
    },

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Builder for [`Ferry`].
pub struct FerryBuilder {
    config: Config,
    store: Option<Arc<dyn OutboxStore>>,
    log: Option<Arc<dyn EventLog>>,
    tracker: Option<Arc<dyn DeliveryTracker>>,
    registry: HandlerRegistry,
}

impl FerryBuilder {
    pub fn outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn DeliveryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Check that every enabled role has what it needs.
    pub fn build(self) -> Result<Ferry, RuntimeError> {
        self.config.validate()?;

        let missing = |role, dependency| RuntimeError::Missing { role, dependency };

        let dispatcher = if self.config.dispatcher.enabled {
            let store = self.store.ok_or(missing("dispatcher", "outbox store"))?;
            let log = self.log.clone().ok_or(missing("dispatcher", "event log"))?;
            Some(Dispatcher::new(
                store,
                log,
                &self.config.stream,
                self.config.dispatcher.clone(),
            ))
        } else {
            None
        };

        let consumer = if self.config.consumer.enabled {
            let log = self.log.ok_or(missing("consumer", "event log"))?;
            let tracker = self.tracker.ok_or(missing("consumer", "delivery tracker"))?;
            Some(Consumer::new(
                log,
                tracker,
                Arc::new(self.registry),
                &self.config,
            ))
        } else {
            None
        };

        Ok(Ferry {
            dispatcher,
            consumer,
        })
    }
}

/// Configured dispatcher and consumer, ready to spawn.
pub struct Ferry {
    dispatcher: Option<Dispatcher>,
    consumer: Option<Consumer>,
}

impl Ferry {
    pub fn builder(config: Config) -> FerryBuilder {
        FerryBuilder {
            config,
            store: None,
            log: None,
            tracker: None,
            registry: HandlerRegistry::default(),
        }
    }

    /// Connect to PostgreSQL and Redis and wire up the production backends.
    #[cfg(all(feature = "postgres", feature = "redis"))]
    pub async fn connect(config: Config, registry: HandlerRegistry) -> Result<Self, RuntimeError> {
        use crate::idempotency::RedisDeliveryTracker;
        use crate::outbox::PostgresOutboxStore;
        use crate::stream::{RedisClient, RedisEventLog};

        config.validate()?;

        let redis = RedisClient::connect(&config.redis.url).await?;
        let log = Arc::new(RedisEventLog::new(&redis).await?);
        let tracker = Arc::new(RedisDeliveryTracker::new(&redis, config.service_name.clone()));

        let mut builder = Self::builder(config.clone())
            .event_log(log)
            .tracker(tracker)
            .handlers(registry);
        if config.dispatcher.enabled {
            let store = PostgresOutboxStore::connect(
                &config.database.url,
                config.database.max_connections,
            )
            .await?;
            builder = builder.outbox(Arc::new(store));
        }
        builder.build()
    }

    /// Start the enabled roles.
    pub fn spawn(self) -> FerryHandle {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        if let Some(dispatcher) = self.dispatcher {
            tasks.push(tokio::spawn(dispatcher.run(token.child_token())));
        }
        if let Some(consumer) = self.consumer {
            tasks.push(tokio::spawn(consumer.run(token.child_token())));
        }

        info!(tasks = tasks.len(), "Ferry started");
        FerryHandle { token, tasks }
    }
}

/// Running background roles.
pub struct FerryHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FerryHandle {
    /// Token that stops every role when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the roles to stop on their own (after the token is cancelled).
    pub async fn join(self) {
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Background task panicked");
            }
        }
    }

    /// Cancel every role and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
        info!("Ferry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::MockDeliveryTracker;
    use crate::outbox::MockOutboxStore;
    use crate::stream::MockEventLog;
    use crate::test_utils::RecordingHandler;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> Config {
        let mut config = Config::for_test();
        config.service_name = "wallets".to_string();
        config.dispatcher.interval_ms = 10;
        config.consumer.block_ms = 20;
        config
    }

    #[test]
    fn test_build_requires_store_for_dispatcher() {
        let err = Ferry::builder(fast_config())
            .event_log(Arc::new(MockEventLog::new()))
            .tracker(Arc::new(MockDeliveryTracker::new()))
            .build()
            .err()
            .unwrap();

        assert!(matches!(
            err,
            RuntimeError::Missing {
                role: "dispatcher",
                ..
            }
        ));
    }

    #[test]
    fn test_consumer_only_needs_no_store() {
        let mut config = fast_config();
        config.dispatcher.enabled = false;

        let built = Ferry::builder(config)
            .event_log(Arc::new(MockEventLog::new()))
            .tracker(Arc::new(MockDeliveryTracker::new()))
            .build();

        assert!(built.is_ok());
    }

    #[test]
    fn test_build_validates_config() {
        let mut config = fast_config();
        config.consumer.max_retries = 0;

        let err = Ferry::builder(config).build().err().unwrap();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn test_outbox_row_reaches_handler() {
        let store = MockOutboxStore::new();
        let handler = RecordingHandler::new("wallet.created");
        let seen = handler.seen();

        let handle = Ferry::builder(fast_config())
            .outbox(Arc::new(store.clone()))
            .event_log(Arc::new(MockEventLog::new()))
            .tracker(Arc::new(MockDeliveryTracker::new()))
            .handlers(HandlerRegistry::builder().register(handler).build())
            .build()
            .unwrap()
            .spawn();

        let row = store
            .insert("wallet.created", json!({"walletId": "w1"}))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![row.id]);
        assert_eq!(store.unpublished_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_to_do() {
        let handle = Ferry::builder(fast_config())
            .outbox(Arc::new(MockOutboxStore::new()))
            .event_log(Arc::new(MockEventLog::new()))
            .tracker(Arc::new(MockDeliveryTracker::new()))
            .build()
            .unwrap()
            .spawn();

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
