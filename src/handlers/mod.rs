//! Event handler contract and routing table.
//!
//! Handlers are registered explicitly at startup. The consumer looks up the
//! handlers for an entry's event type and invokes them in registration
//! order; one failing handler fails the whole entry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::Event;

/// Error returned by a handler.
///
/// The message ends up in the dead-letter entry when retries run out.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// A reaction to one event type.
///
/// Handlers run at least once per event and must tolerate re-execution
/// after a partial failure: the idempotency marker is released when any
/// handler for the event fails, so every handler for that type runs again
/// on retry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Routing key this handler subscribes to.
    fn event_type(&self) -> &str;

    /// Name used in logs. Defaults to the event type.
    fn name(&self) -> &str {
        self.event_type()
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Event type → handlers, in registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Build from a static table of handlers.
    pub fn from_handlers(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        handlers
            .into_iter()
            .fold(Self::builder(), HandlerRegistryBuilder::register_arc)
            .build()
    }

    /// Handlers for `event_type`; empty when none are registered.
    pub fn handlers(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.routes
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Registered routing keys, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    routes: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistryBuilder {
    pub fn register(self, handler: impl EventHandler + 'static) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.routes
            .entry(handler.event_type().to_string())
            .or_default()
            .push(handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        event_type: &'static str,
        name: &'static str,
    }

    #[async_trait]
    impl EventHandler for Named {
        fn event_type(&self) -> &str {
            self.event_type
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct Unnamed;

    #[async_trait]
    impl EventHandler for Unnamed {
        fn event_type(&self) -> &str {
            "user.created"
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_handlers_keep_registration_order() {
        let registry = HandlerRegistry::builder()
            .register(Named {
                event_type: "wallet.created",
                name: "create-address",
            })
            .register(Named {
                event_type: "wallet.created",
                name: "notify",
            })
            .build();

        let names: Vec<&str> = registry
            .handlers("wallet.created")
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["create-address", "notify"]);
    }

    #[test]
    fn test_unknown_type_has_no_handlers() {
        let registry = HandlerRegistry::builder().register(Unnamed).build();

        assert!(registry.handlers("wallet.created").is_empty());
    }

    #[test]
    fn test_name_defaults_to_event_type() {
        let registry = HandlerRegistry::from_handlers(vec![Arc::new(Unnamed)]);

        assert_eq!(registry.handlers("user.created")[0].name(), "user.created");
        assert_eq!(registry.event_types(), vec!["user.created"]);
    }
}
