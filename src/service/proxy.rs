//! Service Proxy
//!
//! Routes `invoke(method, args)` calls to an instance of a named service:
//! 1. a local instance, when the proxy's scope includes this node;
//! 2. otherwise a remote node taken from the assignment table, round-robin per call,
//!    or pinned for the life of the handle when the proxy is sticky.
//!
//! A remote call that cannot reach its target fails with
//! [`FabricError::ServiceUnavailable`] and is never retried by the proxy. A sticky proxy
//! drops its pinned target on that failure, and also when membership already shows the
//! target gone, so the next call resolves afresh.

use super::manager::ServiceDeploymentManager;
use crate::cluster::types::NodeId;
use crate::cluster::view::ClusterGroup;
use crate::error::{FabricError, Result};

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub struct ServiceProxy {
    name: String,
    sticky: bool,
    scope: ClusterGroup,
    manager: Arc<ServiceDeploymentManager>,
    /// Pinned remote target of a sticky proxy.
    cached: Mutex<Option<NodeId>>,
    cursor: AtomicUsize,
    timeout: Duration,
}

impl ServiceProxy {
    pub(crate) fn new(
        name: String,
        sticky: bool,
        scope: ClusterGroup,
        manager: Arc<ServiceDeploymentManager>,
    ) -> Self {
        let timeout = manager.request_timeout();
        Self {
            name,
            sticky,
            scope,
            manager,
            cached: Mutex::new(None),
            // Random start so proxies created together do not all hit the same node first.
            cursor: AtomicUsize::new(rand::random::<usize>()),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    pub fn scope(&self) -> &ClusterGroup {
        &self.scope
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Remote node a sticky proxy is currently pinned to.
    pub async fn pinned_target(&self) -> Option<NodeId> {
        self.cached.lock().await.clone()
    }

    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let local = self.manager.local_node_id().clone();

        if self.scope.contains(&local)
            && let Some(service) = self.manager.local_instance(&self.name)
        {
            tracing::trace!("Invoking {}.{} in-process", self.name, method);
            return service
                .invoke(method, args)
                .await
                .map_err(|e| FabricError::ServiceInvocation(e.to_string()));
        }

        let target = self.resolve(&local).await?;

        match self
            .manager
            .invoke_remote(&target, &self.name, method, args, self.timeout)
            .await
        {
            Ok(value) => Ok(value),
            Err(FabricError::ServiceInvocation(message)) => Err(FabricError::ServiceInvocation(message)),
            Err(e) => {
                tracing::warn!("Service {} on {} unavailable: {}", self.name, target, e);
                self.forget(&target).await;
                Err(FabricError::ServiceUnavailable {
                    name: self.name.clone(),
                    node: target,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn resolve(&self, local: &NodeId) -> Result<NodeId> {
        if !self.sticky {
            return self.pick(local).await;
        }

        let mut cached = self.cached.lock().await;
        if let Some(target) = cached.as_ref() {
            if self.manager.cluster().is_alive(target) {
                return Ok(target.clone());
            }
            tracing::info!("Pinned target {} of {} left; re-resolving", target, self.name);
        }

        let target = self.pick(local).await?;
        tracing::debug!("Sticky proxy for {} pinned to {}", self.name, target);
        *cached = Some(target.clone());
        Ok(target)
    }

    async fn pick(&self, local: &NodeId) -> Result<NodeId> {
        let cluster = self.manager.cluster();
        let candidates: Vec<NodeId> = self
            .manager
            .table()
            .await
            .nodes_for(&self.name)
            .into_iter()
            .filter(|node| node != local && self.scope.contains(node) && cluster.is_alive(node))
            .collect();

        if candidates.is_empty() {
            return Err(FabricError::NoServiceInstance(self.name.clone()));
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }

    async fn forget(&self, target: &NodeId) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref() == Some(target) {
            *cached = None;
        }
    }
}
