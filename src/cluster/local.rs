//! In-process cluster membership.
//!
//! Several fabric nodes living in one process share a [`LocalCluster`]; each gets its
//! own [`LocalClusterView`]. Joins and leaves are explicit, which makes membership
//! races reproducible in tests.

use super::types::{MembershipEvent, MembershipListener, NodeId};
use super::view::ClusterView;

use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct LocalCluster {
    members: DashSet<NodeId>,
    /// Listeners keyed by the node that registered them, so a leaving node
    /// stops receiving events.
    listeners: DashMap<NodeId, Vec<MembershipListener>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: DashSet::new(),
            listeners: DashMap::new(),
        })
    }

    pub fn view(self: &Arc<Self>, local: NodeId) -> Arc<LocalClusterView> {
        Arc::new(LocalClusterView {
            local,
            cluster: self.clone(),
        })
    }

    pub fn join(&self, node: NodeId) {
        if !self.members.insert(node.clone()) {
            return;
        }

        tracing::info!("Node {} joined (cluster size {})", node, self.members.len());
        self.notify(&node, MembershipEvent::Joined(node.clone()));
    }

    pub fn leave(&self, node: &NodeId) {
        if self.members.remove(node).is_none() {
            return;
        }

        self.listeners.remove(node);

        tracing::info!("Node {} left (cluster size {})", node, self.members.len());
        self.notify(node, MembershipEvent::Left(node.clone()));
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.members.iter().map(|entry| entry.key().clone()).collect()
    }

    fn notify(&self, subject: &NodeId, event: MembershipEvent) {
        // Snapshot first: listeners may read membership while we iterate.
        let listeners: Vec<MembershipListener> = self
            .listeners
            .iter()
            .filter(|entry| entry.key() != subject)
            .flat_map(|entry| entry.value().clone())
            .collect();

        for listener in listeners {
            listener(event.clone());
        }
    }
}

pub struct LocalClusterView {
    local: NodeId,
    cluster: Arc<LocalCluster>,
}

impl ClusterView for LocalClusterView {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn members(&self) -> BTreeSet<NodeId> {
        self.cluster.members()
    }

    fn on_membership_change(&self, listener: MembershipListener) {
        self.cluster
            .listeners
            .entry(self.local.clone())
            .or_default()
            .push(listener);
    }

    fn is_alive(&self, node: &NodeId) -> bool {
        self.cluster.members.contains(node)
    }
}
