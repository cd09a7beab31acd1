use super::types::{MembershipListener, NodeId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Membership snapshot consumed by the compute and service subsystems.
///
/// Implementations must deliver membership events to listeners outside of any
/// internal lock: listeners are allowed to call back into `members()`.
pub trait ClusterView: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Currently live members, the local node included.
    fn members(&self) -> BTreeSet<NodeId>;

    fn on_membership_change(&self, listener: MembershipListener);

    fn is_alive(&self, node: &NodeId) -> bool {
        self.members().contains(node)
    }

    fn size(&self) -> usize {
        self.members().len()
    }
}

/// A data-only projection over the live membership.
///
/// Used as a service affinity filter and as a proxy routing scope. Being plain data
/// it can be shipped between nodes and compared, which makes redeploying an
/// identical descriptor idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterGroup {
    #[default]
    All,
    Only(BTreeSet<NodeId>),
    Except(BTreeSet<NodeId>),
}

impl ClusterGroup {
    pub fn all() -> Self {
        ClusterGroup::All
    }

    pub fn for_node(node: NodeId) -> Self {
        ClusterGroup::Only(BTreeSet::from([node]))
    }

    pub fn for_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        ClusterGroup::Only(nodes.into_iter().collect())
    }

    pub fn for_others(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        ClusterGroup::Except(nodes.into_iter().collect())
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        match self {
            ClusterGroup::All => true,
            ClusterGroup::Only(nodes) => nodes.contains(node),
            ClusterGroup::Except(nodes) => !nodes.contains(node),
        }
    }

    /// Live members matching this group, in node-id order.
    pub fn nodes(&self, view: &dyn ClusterView) -> Vec<NodeId> {
        view.members()
            .into_iter()
            .filter(|node| self.contains(node))
            .collect()
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ClusterGroup::All)
    }
}
