//! Message Handler Dispatcher
//!
//! Maps each [`Topic`] to an async closure, so subsystems plug their receive side into
//! any transport without the transport knowing about them.

use super::envelope::{Envelope, Topic};
use crate::cluster::types::NodeId;
use crate::error::FabricError;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Thread-safe async handler. Receives the sender's id and the envelope, and may
/// return a reply for request/response exchanges.
pub type MessageHandlerFn = Arc<
    dyn Fn(NodeId, Envelope) -> Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send>>
        + Send
        + Sync,
>;

pub struct MessageDispatcher {
    handlers: DashMap<Topic, MessageHandlerFn>,
}

impl MessageDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for `topic`, replacing any previous handler.
    pub fn register<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: Fn(NodeId, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Envelope>>> + Send + 'static,
    {
        let handler_fn: MessageHandlerFn = Arc::new(move |from, envelope| {
            Box::pin(handler(from, envelope))
                as Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send>>
        });

        self.insert(topic, handler_fn);
    }

    pub fn insert(&self, topic: Topic, handler: MessageHandlerFn) {
        self.handlers.insert(topic, handler);
        tracing::debug!("Registered message handler for {:?}", topic);
    }

    /// Runs the handler for the envelope's topic.
    pub async fn dispatch(&self, from: NodeId, envelope: Envelope) -> Result<Option<Envelope>> {
        let topic = envelope.topic();

        // Clone out of the map so no shard lock is held across the await.
        let handler = match self.handlers.get(&topic) {
            Some(entry) => entry.value().clone(),
            None => {
                return Err(anyhow::anyhow!(
                    "No handler registered for {} ({:?})",
                    envelope.kind(),
                    topic
                ));
            }
        };

        tracing::trace!("Dispatching {} from {}", envelope.kind(), from);
        handler(from, envelope).await
    }

    /// Request/response flavour of [`dispatch`](Self::dispatch): always yields a reply,
    /// `Ack` for handlers that return nothing and `Failure` for handler errors.
    pub async fn handle_request(&self, from: NodeId, envelope: Envelope) -> Envelope {
        match self.dispatch(from, envelope).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Envelope::Ack,
            Err(e) => Envelope::Failure(FabricError::from_handler(e)),
        }
    }

    pub fn has_handler(&self, topic: Topic) -> bool {
        self.handlers.contains_key(&topic)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
