//! Ferry - transactional outbox and stream delivery.
//!
//! Events are written to an outbox table in the same transaction as the
//! state change that caused them, moved onto a Redis stream by a polling
//! dispatcher, and consumed through a consumer group with idempotency,
//! bounded retries and a dead-letter stream.

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod dlq;
pub mod event;
pub mod handlers;
pub mod idempotency;
pub mod outbox;
pub mod runtime;
pub mod stream;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use consumer::{Consumer, ConsumerId, Outcome};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use event::{Event, OutboxRow};
pub use handlers::{EventHandler, HandlerError, HandlerRegistry};
pub use runtime::{Ferry, FerryHandle};
