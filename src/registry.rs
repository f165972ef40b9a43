//! Consumer registry
//!
//! Explicit mapping from `(subject, action)` to a handler, populated by
//! registration calls at startup. Events without a registered consumer are
//! handled according to the configured error policy.

use crate::config::ErrorPolicy;
use crate::error::{RelayError, Result};
use crate::event::EventData;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Downstream event handler.
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    async fn handle(&self, event: &EventData) -> Result<()>;
}

/// Registry of consumers keyed by lower-cased `(subject, action)`.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: RwLock<HashMap<(String, String), Arc<dyn EventConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for a subject/action pair. Last registration wins.
    pub async fn register(
        &self,
        subject: impl Into<String>,
        action: impl Into<String>,
        consumer: Arc<dyn EventConsumer>,
    ) {
        let key = (
            subject.into().to_lowercase(),
            action.into().to_lowercase(),
        );
        debug!(subject = %key.0, action = %key.1, "registered consumer");
        self.consumers.write().await.insert(key, consumer);
    }

    /// Look up the consumer for an event.
    pub async fn resolve(&self, subject: &str, action: &str) -> Option<Arc<dyn EventConsumer>> {
        let key = (subject.to_lowercase(), action.to_lowercase());
        self.consumers.read().await.get(&key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }

    /// Dispatch an event to its registered consumer.
    ///
    /// Returns `Ok(true)` when handled, `Ok(false)` when skipped under a
    /// row-skipping policy, and an error under [`ErrorPolicy::Handle`].
    pub async fn dispatch(&self, event: &EventData, missing_policy: ErrorPolicy) -> Result<bool> {
        match self.resolve(&event.subject, &event.action).await {
            Some(consumer) => {
                consumer.handle(event).await?;
                Ok(true)
            }
            None => {
                if !missing_policy.skips_row() {
                    return Err(RelayError::NoConsumer {
                        subject: event.subject.clone(),
                        action: event.action.clone(),
                    });
                }
                if missing_policy != ErrorPolicy::Silent {
                    warn!(
                        subject = %event.subject,
                        action = %event.action,
                        "no consumer registered, skipping event"
                    );
                }
                Ok(false)
            }
        }
    }
}
