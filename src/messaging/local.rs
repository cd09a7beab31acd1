//! In-process transport.
//!
//! A [`LocalHub`] connects the dispatchers of nodes living in the same runtime.
//! Delivery is asynchronous (spawned) so handlers never run on the sender's stack,
//! and a node that disconnected is reported unreachable exactly like a dead peer.

use super::channel::{MessageChannel, unwrap_reply};
use super::dispatcher::MessageDispatcher;
use super::envelope::Envelope;
use crate::cluster::types::NodeId;
use crate::error::{FabricError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct LocalHub {
    endpoints: DashMap<NodeId, Arc<MessageDispatcher>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
        })
    }

    /// Registers `node` on the hub and returns its channel.
    pub fn connect(self: &Arc<Self>, node: NodeId) -> Arc<LocalChannel> {
        let dispatcher = MessageDispatcher::new();
        self.endpoints.insert(node.clone(), dispatcher.clone());

        tracing::debug!("Node {} connected to local hub", node);

        Arc::new(LocalChannel {
            local: node,
            hub: self.clone(),
            dispatcher,
        })
    }

    /// Makes `node` unreachable; in-flight handlers keep running.
    pub fn disconnect(&self, node: &NodeId) {
        if self.endpoints.remove(node).is_some() {
            tracing::debug!("Node {} disconnected from local hub", node);
        }
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.endpoints.contains_key(node)
    }

    fn endpoint(&self, node: &NodeId) -> Result<Arc<MessageDispatcher>> {
        self.endpoints
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FabricError::NodeUnreachable(node.clone()))
    }
}

pub struct LocalChannel {
    local: NodeId,
    hub: Arc<LocalHub>,
    dispatcher: Arc<MessageDispatcher>,
}

#[async_trait]
impl MessageChannel for LocalChannel {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<()> {
        let target = self.hub.endpoint(to)?;
        let from = self.local.clone();
        let to = to.clone();

        tokio::spawn(async move {
            let kind = envelope.kind();
            if let Err(e) = target.dispatch(from, envelope).await {
                tracing::warn!("Handler for {} on {} failed: {:#}", kind, to, e);
            }
        });

        Ok(())
    }

    async fn request(&self, to: &NodeId, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let target = self.hub.endpoint(to)?;
        let from = self.local.clone();
        let kind = envelope.kind();

        // The handler runs to completion even if the requester gives up.
        let handle = tokio::spawn(async move { target.handle_request(from, envelope).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(reply)) => unwrap_reply(reply),
            Ok(Err(join_err)) => Err(FabricError::Transport(format!(
                "handler for {} on {} aborted: {}",
                kind, to, join_err
            ))),
            Err(_) => Err(FabricError::Timeout(format!(
                "{} to {} after {:?}",
                kind, to, timeout
            ))),
        }
    }
}
