use crate::cluster::types::NodeId;
use crate::cluster::view::ClusterGroup;
use crate::error::{FabricError, Result as FabricResult};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// One instance on every matching node, present or future.
    NodeSingleton,
    /// Exactly one instance cluster-wide.
    ClusterSingleton,
    /// `n` instances on every matching node.
    PerNodeCount(usize),
    /// `n` instances in total, spread evenly over matching nodes.
    TotalCount(usize),
}

/// What to deploy and where. Pure data: two deploys of the same descriptor are the
/// same deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Key into each node's [`ServiceRegistry`].
    pub service_type: String,
    pub cardinality: Cardinality,
    /// Affinity filter; only matching nodes host instances.
    pub filter: ClusterGroup,
    /// Handed to every instance through its [`ServiceContext`].
    pub config: Value,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            cardinality,
            filter: ClusterGroup::All,
            config: Value::Null,
        }
    }

    pub fn with_filter(mut self, filter: ClusterGroup) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.name.is_empty() {
            return Err(FabricError::InvalidArgument("service name must not be empty".to_string()));
        }
        if self.service_type.is_empty() {
            return Err(FabricError::InvalidArgument(format!(
                "service '{}' has no service type",
                self.name
            )));
        }
        if matches!(
            self.cardinality,
            Cardinality::PerNodeCount(0) | Cardinality::TotalCount(0)
        ) {
            return Err(FabricError::InvalidArgument(format!(
                "service '{}' must request at least one instance",
                self.name
            )));
        }
        Ok(())
    }
}

/// Per-instance context.
pub struct ServiceContext {
    name: String,
    node_id: NodeId,
    instance: usize,
    config: Value,
    token: CancellationToken,
}

impl ServiceContext {
    pub(crate) fn new(name: String, node_id: NodeId, instance: usize, config: Value) -> Self {
        Self {
            name,
            node_id,
            instance,
            config,
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Index of this instance among the service's instances on this node.
    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn cancel_token(&self) {
        self.token.cancel();
    }
}

/// A long-lived, deployable service.
///
/// Lifecycle per instance: `init`, then `execute` in the background until the
/// context is cancelled, then `cancel`. Calls arrive through `invoke`.
#[async_trait]
pub trait Service: Send + Sync {
    async fn init(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Background body; the default idles until cancelled.
    async fn execute(&self, ctx: &ServiceContext) -> Result<()> {
        ctx.cancelled().await;
        Ok(())
    }

    async fn cancel(&self, ctx: &ServiceContext) {
        let _ = ctx;
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value>;
}

pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// Service types this node is able to host.
pub struct ServiceRegistry {
    factories: DashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, S>(&self, service_type: &str, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Service + 'static,
    {
        let factory_fn: ServiceFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Service>);
        self.factories.insert(service_type.to_string(), factory_fn);

        tracing::info!("Registered service type: {}", service_type);
    }

    pub fn create(&self, service_type: &str) -> FabricResult<Arc<dyn Service>> {
        let factory = self
            .factories
            .get(service_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FabricError::InvalidArgument(format!("unknown service type '{}'", service_type)))?;

        Ok(factory())
    }

    pub fn has_type(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }
}
