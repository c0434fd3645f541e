use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::utils::error::Result;

/// A pluggable processing step applied to delivered messages.
///
/// Handlers declare which messages they accept; the delivery engine runs
/// the first registered handler whose `can_handle` matches. A returned
/// error drives the message's retry/dead-letter transition and is never
/// propagated as a broker failure.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, message: &Message) -> bool;

    async fn process(&self, message: &Message) -> Result<()>;
}

/// Registered handlers, resolved per message at delivery time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn resolve(&self, message: &Message) -> Option<Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|handler| handler.can_handle(message))
            .cloned()
    }

    /// Runs the matching handler. A message no handler accepts completes
    /// trivially.
    pub async fn process(&self, message: &Message) -> Result<()> {
        match self.resolve(message) {
            Some(handler) => {
                tracing::debug!(
                    "processing message {} with handler {}",
                    message.id,
                    handler.name()
                );
                handler.process(message).await
            }
            None => {
                tracing::debug!("no handler for message {}, completing as-is", message.id);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

/// Default handler: accepts everything and only logs the delivery.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn can_handle(&self, _message: &Message) -> bool {
        true
    }

    async fn process(&self, message: &Message) -> Result<()> {
        tracing::info!(
            "delivered message {} from topic {} at offset {}",
            message.id,
            message.topic,
            message.offset
        );
        Ok(())
    }
}
