use crate::cluster::types::NodeId;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the node a job is sent to.
pub trait LoadBalancer: Send + Sync {
    /// Chooses among `candidates`, avoiding `exclude` unless nothing else is left.
    fn select(&self, candidates: &[NodeId], exclude: &[NodeId]) -> Option<NodeId>;
}

/// Cycles through the candidates with a shared cursor.
#[derive(Default)]
pub struct RoundRobinLoadBalancer {
    cursor: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select(&self, candidates: &[NodeId], exclude: &[NodeId]) -> Option<NodeId> {
        let preferred: Vec<&NodeId> = candidates
            .iter()
            .filter(|node| !exclude.contains(node))
            .collect();

        let pool: Vec<&NodeId> = if preferred.is_empty() {
            candidates.iter().collect()
        } else {
            preferred
        };

        if pool.is_empty() {
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[index].clone())
    }
}
