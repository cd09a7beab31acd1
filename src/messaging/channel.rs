use super::dispatcher::{MessageDispatcher, MessageHandlerFn};
use super::envelope::{Envelope, Topic};
use crate::cluster::types::NodeId;
use crate::error::{FabricError, Result};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Point-to-point delivery between nodes.
///
/// `send` is fire-and-forget: success only means the message was handed to the
/// transport. `request` waits for the handler's reply, bounded by `timeout`; a
/// `Failure` reply is surfaced as the error it carries.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Receive side of this channel.
    fn dispatcher(&self) -> &Arc<MessageDispatcher>;

    fn on_message(&self, topic: Topic, handler: MessageHandlerFn) {
        self.dispatcher().insert(topic, handler);
    }

    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<()>;

    async fn request(&self, to: &NodeId, envelope: Envelope, timeout: Duration) -> Result<Envelope>;

    /// Sends to every node in `targets`, returning one outcome per target.
    async fn broadcast(&self, targets: &[NodeId], envelope: Envelope) -> Vec<(NodeId, Result<()>)> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push((target.clone(), self.send(target, envelope.clone()).await));
        }
        outcomes
    }
}

/// Turns a `Failure` reply into an error.
pub(crate) fn unwrap_reply(reply: Envelope) -> Result<Envelope> {
    match reply {
        Envelope::Failure(err) => Err(err),
        other => Ok(other),
    }
}

/// Rejects a reply of the wrong kind.
pub(crate) fn unexpected_reply(expected: &str, reply: &Envelope) -> FabricError {
    FabricError::Transport(format!("expected {} reply, got {}", expected, reply.kind()))
}
