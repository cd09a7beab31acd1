use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Cluster-wide identity of a node.
///
/// Ordered, so that "smallest live node" is a deterministic tie-break everywhere
/// (deployment coordinator election, singleton placement).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Left(NodeId),
}

impl MembershipEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            MembershipEvent::Joined(id) | MembershipEvent::Left(id) => id,
        }
    }
}

pub type MembershipListener = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// A member as seen by the gossip layer.
///
/// `incarnation` is a logical clock: the member itself bumps it to refute a
/// suspicion, and higher incarnations always win when views are merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// UDP datagrams exchanged by [`super::gossip::GossipMembership`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping { from: Node, incarnation: u64 },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join { node: Node },

    Suspect { node_id: NodeId, incarnation: u64 },

    Alive { node_id: NodeId, incarnation: u64 },
}
