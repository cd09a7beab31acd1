//! Instance placement.
//!
//! [`compute_assignment`] is a pure function of the descriptor, the eligible nodes and
//! the previous placement, so every node that runs it over the same inputs agrees.

use super::types::{Cardinality, ServiceDescriptor};
use crate::cluster::types::NodeId;

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAssignment {
    pub descriptor: ServiceDescriptor,
    /// Node -> instance count; nodes with no instance are absent.
    pub nodes: BTreeMap<NodeId, usize>,
}

/// Cluster-wide placement of every deployed service, as published by the
/// deployment coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTable {
    pub version: u64,
    pub coordinator: Option<NodeId>,
    pub services: BTreeMap<String, ServiceAssignment>,
}

impl AssignmentTable {
    /// Higher version wins; on equal versions the smaller coordinator id wins.
    pub fn supersedes(&self, other: &AssignmentTable) -> bool {
        (self.version, Reverse(&self.coordinator)) > (other.version, Reverse(&other.coordinator))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name).map(|assignment| &assignment.descriptor)
    }

    /// Nodes hosting at least one instance of `name`, in node-id order.
    pub fn nodes_for(&self, name: &str) -> Vec<NodeId> {
        self.services
            .get(name)
            .map(|assignment| {
                assignment
                    .nodes
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(node, _)| node.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_on(&self, name: &str, node: &NodeId) -> usize {
        self.services
            .get(name)
            .and_then(|assignment| assignment.nodes.get(node).copied())
            .unwrap_or(0)
    }

    pub fn total_instances(&self, name: &str) -> usize {
        self.services
            .get(name)
            .map_or(0, |assignment| assignment.nodes.values().sum())
    }
}

/// Computes the placement of `descriptor` over `eligible` nodes.
///
/// Stable: a cluster singleton stays where it is while its host is eligible, and a
/// total count keeps its extra instances on the nodes that already had them.
pub fn compute_assignment(
    descriptor: &ServiceDescriptor,
    eligible: &[NodeId],
    previous: Option<&BTreeMap<NodeId, usize>>,
) -> BTreeMap<NodeId, usize> {
    let mut nodes: Vec<NodeId> = eligible.to_vec();
    nodes.sort();
    nodes.dedup();

    if nodes.is_empty() {
        return BTreeMap::new();
    }

    let previous_count = |node: &NodeId| previous.and_then(|p| p.get(node).copied()).unwrap_or(0);

    match descriptor.cardinality {
        Cardinality::NodeSingleton => nodes.into_iter().map(|node| (node, 1)).collect(),
        Cardinality::PerNodeCount(n) => nodes.into_iter().map(|node| (node, n)).collect(),
        Cardinality::ClusterSingleton => {
            let host = nodes
                .iter()
                .find(|node| previous_count(*node) > 0)
                .unwrap_or(&nodes[0])
                .clone();
            BTreeMap::from([(host, 1)])
        }
        Cardinality::TotalCount(total) => {
            let base = total / nodes.len();
            let extra = total % nodes.len();

            let mut ranked = nodes.clone();
            ranked.sort_by_key(|node| (Reverse(previous_count(node)), node.clone()));

            ranked
                .into_iter()
                .enumerate()
                .map(|(rank, node)| (node, base + usize::from(rank < extra)))
                .filter(|(_, count)| *count > 0)
                .collect()
        }
    }
}
