//! Grid Node
//!
//! Wires one fabric node together: the task processor and job worker on the compute
//! side, the deployment manager on the service side, and the message handlers and
//! membership listener that feed them. [`GridNode`] exposes three facades:
//!
//! - [`GridNode::compute`]: submit, cancel and await tasks;
//! - [`GridNode::services`]: deploy, undeploy and proxy services, optionally scoped
//!   to a [`ClusterGroup`] through [`GridNode::services_for`];
//! - [`GridNode::cluster`]: build cluster groups relative to this node.
//!
//! [`LocalGrid`] runs several nodes inside one process over a shared
//! [`LocalCluster`] and [`LocalHub`].

use crate::checkpoint::CheckpointStores;
use crate::cluster::local::LocalCluster;
use crate::cluster::types::{MembershipEvent, NodeId};
use crate::cluster::view::{ClusterGroup, ClusterView};
use crate::compute::balancer::{LoadBalancer, RoundRobinLoadBalancer};
use crate::compute::job::JobRegistry;
use crate::compute::processor::{ComputeContext, TaskFuture, TaskProcessor};
use crate::compute::task::ComputeTask;
use crate::compute::types::{SessionId, TaskOutcome};
use crate::compute::worker::JobWorker;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::messaging::channel::MessageChannel;
use crate::messaging::envelope::Topic;
use crate::messaging::local::LocalHub;
use crate::service::manager::ServiceDeploymentManager;
use crate::service::proxy::ServiceProxy;
use crate::service::types::{Cardinality, ServiceDescriptor, ServiceRegistry};

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct GridNode {
    id: NodeId,
    cluster: Arc<dyn ClusterView>,
    channel: Arc<dyn MessageChannel>,
    jobs: Arc<JobRegistry>,
    service_types: Arc<ServiceRegistry>,
    processor: Arc<TaskProcessor>,
    worker: Arc<JobWorker>,
    deployments: Arc<ServiceDeploymentManager>,
}

impl GridNode {
    pub fn start(
        cluster: Arc<dyn ClusterView>,
        channel: Arc<dyn MessageChannel>,
        checkpoints: Arc<CheckpointStores>,
        config: FabricConfig,
    ) -> Arc<Self> {
        Self::start_with_balancer(
            cluster,
            channel,
            checkpoints,
            config,
            Arc::new(RoundRobinLoadBalancer::new()),
        )
    }

    pub fn start_with_balancer(
        cluster: Arc<dyn ClusterView>,
        channel: Arc<dyn MessageChannel>,
        checkpoints: Arc<CheckpointStores>,
        config: FabricConfig,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Arc<Self> {
        let id = cluster.local_node_id();

        let ctx = Arc::new(ComputeContext {
            channel: channel.clone(),
            cluster: cluster.clone(),
            balancer,
            checkpoints,
            config: config.clone(),
        });

        let jobs = JobRegistry::new();
        let service_types = ServiceRegistry::new();
        let processor = TaskProcessor::new(ctx.clone());
        let worker = JobWorker::new(jobs.clone(), ctx);
        let deployments = ServiceDeploymentManager::new(
            cluster.clone(),
            channel.clone(),
            service_types.clone(),
            config,
        );

        let node = Arc::new(Self {
            id,
            cluster,
            channel,
            jobs,
            service_types,
            processor,
            worker,
            deployments,
        });

        node.install_handlers();
        node.watch_membership();

        tracing::info!("Grid node {} started", node.id);
        node
    }

    fn install_handlers(&self) {
        let dispatcher = self.channel.dispatcher();

        let worker = self.worker.clone();
        dispatcher.register(Topic::Job, move |from, envelope| {
            let worker = worker.clone();
            async move { worker.handle_message(from, envelope).await }
        });

        let processor = self.processor.clone();
        dispatcher.register(Topic::Task, move |from, envelope| {
            let processor = processor.clone();
            async move { processor.handle_task_message(from, envelope).await }
        });

        let processor = self.processor.clone();
        dispatcher.register(Topic::Checkpoint, move |from, envelope| {
            let processor = processor.clone();
            async move { processor.handle_checkpoint_message(from, envelope).await }
        });

        let deployments = self.deployments.clone();
        dispatcher.register(Topic::Deployment, move |from, envelope| {
            let deployments = deployments.clone();
            async move { deployments.handle_deployment_message(from, envelope).await }
        });

        let deployments = self.deployments.clone();
        dispatcher.register(Topic::Service, move |from, envelope| {
            let deployments = deployments.clone();
            async move { deployments.handle_service_message(from, envelope).await }
        });
    }

    fn watch_membership(&self) {
        // Weak: the cluster view outlives a stopped node.
        let processor: Weak<TaskProcessor> = Arc::downgrade(&self.processor);
        let deployments: Weak<ServiceDeploymentManager> = Arc::downgrade(&self.deployments);

        self.cluster.on_membership_change(Arc::new(move |event: MembershipEvent| {
            if let MembershipEvent::Left(node) = &event
                && let Some(processor) = processor.upgrade()
            {
                processor.on_node_left(node);
            }

            if let Some(deployments) = deployments.upgrade() {
                deployments.on_membership_event(event);
            }
        }));
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Job types this node can execute.
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Service types this node can host.
    pub fn service_types(&self) -> &Arc<ServiceRegistry> {
        &self.service_types
    }

    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    pub fn worker(&self) -> &Arc<JobWorker> {
        &self.worker
    }

    pub fn deployments(&self) -> &Arc<ServiceDeploymentManager> {
        &self.deployments
    }

    pub fn compute(&self) -> GridCompute<'_> {
        GridCompute { node: self }
    }

    pub fn services(&self) -> GridServices<'_> {
        self.services_for(ClusterGroup::All)
    }

    /// Service operations restricted to `group`: deployments are filtered to it and
    /// proxies only route to it.
    pub fn services_for(&self, group: ClusterGroup) -> GridServices<'_> {
        GridServices { node: self, scope: group }
    }

    pub fn cluster(&self) -> GridCluster<'_> {
        GridCluster { node: self }
    }

    /// Stops local service instances. Tasks started here keep running until they
    /// complete or their peers notice the departure.
    pub async fn shutdown(&self) {
        tracing::info!("Grid node {} shutting down", self.id);
        self.deployments.shutdown().await;
    }
}

pub struct GridCompute<'a> {
    node: &'a GridNode,
}

impl GridCompute<'_> {
    pub fn submit(&self, task: Arc<dyn ComputeTask>, arg: Option<Value>) -> Result<TaskFuture> {
        self.node.processor.submit(task, arg, None)
    }

    pub fn submit_with_timeout(
        &self,
        task: Arc<dyn ComputeTask>,
        arg: Option<Value>,
        timeout: Duration,
    ) -> Result<TaskFuture> {
        self.node.processor.submit(task, arg, Some(timeout))
    }

    /// Submits and waits for the outcome.
    pub async fn execute(&self, task: Arc<dyn ComputeTask>, arg: Option<Value>) -> Result<TaskOutcome> {
        self.submit(task, arg)?.get().await
    }

    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.node.processor.cancel(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.node.processor.active_sessions()
    }
}

pub struct GridServices<'a> {
    node: &'a GridNode,
    scope: ClusterGroup,
}

impl GridServices<'_> {
    pub fn scope(&self) -> &ClusterGroup {
        &self.scope
    }

    /// Deploys `descriptor`. A descriptor without its own filter inherits this
    /// facade's scope.
    pub async fn deploy(&self, mut descriptor: ServiceDescriptor) -> Result<()> {
        if descriptor.filter.is_all() {
            descriptor.filter = self.scope.clone();
        }
        self.node.deployments.deploy(descriptor).await
    }

    pub async fn deploy_node_singleton(&self, name: &str, service_type: &str) -> Result<()> {
        self.deploy(ServiceDescriptor::new(name, service_type, Cardinality::NodeSingleton))
            .await
    }

    pub async fn deploy_cluster_singleton(&self, name: &str, service_type: &str) -> Result<()> {
        self.deploy(ServiceDescriptor::new(name, service_type, Cardinality::ClusterSingleton))
            .await
    }

    /// `total > 0` deploys exactly `total` instances across the group; otherwise
    /// `per_node` instances go to every eligible node.
    pub async fn deploy_multiple(
        &self,
        name: &str,
        service_type: &str,
        total: usize,
        per_node: usize,
    ) -> Result<()> {
        let cardinality = if total > 0 {
            Cardinality::TotalCount(total)
        } else {
            Cardinality::PerNodeCount(per_node)
        };
        self.deploy(ServiceDescriptor::new(name, service_type, cardinality))
            .await
    }

    pub async fn undeploy(&self, name: &str) -> Result<()> {
        self.node.deployments.undeploy(name).await
    }

    pub async fn undeploy_all(&self) -> Result<()> {
        self.node.deployments.undeploy_all().await
    }

    pub async fn service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.node.deployments.descriptors().await
    }

    /// A proxy for `name`, routed within this facade's scope.
    pub fn proxy(&self, name: &str, sticky: bool) -> Result<ServiceProxy> {
        if name.is_empty() {
            return Err(FabricError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }

        Ok(ServiceProxy::new(
            name.to_string(),
            sticky,
            self.scope.clone(),
            self.node.deployments.clone(),
        ))
    }
}

pub struct GridCluster<'a> {
    node: &'a GridNode,
}

impl GridCluster<'_> {
    pub fn local_node_id(&self) -> NodeId {
        self.node.id.clone()
    }

    pub fn for_local(&self) -> ClusterGroup {
        ClusterGroup::for_node(self.node.id.clone())
    }

    pub fn for_remotes(&self) -> ClusterGroup {
        ClusterGroup::for_others([self.node.id.clone()])
    }

    pub fn for_node(&self, node: NodeId) -> ClusterGroup {
        ClusterGroup::for_node(node)
    }

    pub fn for_others(&self, nodes: impl IntoIterator<Item = NodeId>) -> ClusterGroup {
        ClusterGroup::for_others(nodes)
    }

    /// Live members of `group`, in node-id order.
    pub fn nodes(&self, group: &ClusterGroup) -> Vec<NodeId> {
        group.nodes(self.node.cluster.as_ref())
    }

    pub fn size(&self) -> usize {
        self.node.cluster.size()
    }
}

/// Several grid nodes in one process.
pub struct LocalGrid {
    cluster: Arc<LocalCluster>,
    hub: Arc<LocalHub>,
    checkpoints: Arc<CheckpointStores>,
    config: FabricConfig,
    nodes: DashMap<NodeId, Arc<GridNode>>,
    next_index: AtomicUsize,
}

impl LocalGrid {
    pub fn new(config: FabricConfig) -> Self {
        let checkpoints = CheckpointStores::new(config.default_checkpoint_store.clone());
        Self {
            cluster: LocalCluster::new(),
            hub: LocalHub::new(),
            checkpoints,
            config,
            nodes: DashMap::new(),
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    /// Checkpoint stores shared by every node of this grid.
    pub fn checkpoints(&self) -> &Arc<CheckpointStores> {
        &self.checkpoints
    }

    pub async fn start_node(&self) -> Arc<GridNode> {
        self.start_node_with(|_| {}).await
    }

    /// Starts a node, lets `setup` register its job and service types, then joins
    /// it to the cluster.
    pub async fn start_node_with(&self, setup: impl FnOnce(&GridNode)) -> Arc<GridNode> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        // Zero-padded so node-id order matches start order.
        let id = NodeId(format!("node-{:02}", index));

        let channel = self.hub.connect(id.clone());
        let view = self.cluster.view(id.clone());
        let node = GridNode::start(view, channel, self.checkpoints.clone(), self.config.clone());

        setup(&node);

        self.nodes.insert(id.clone(), node.clone());
        self.cluster.join(id);

        // The joining node is not notified about itself.
        node.deployments.handle_topology_change().await;
        node
    }

    pub async fn stop_node(&self, id: &NodeId) {
        let Some((_, node)) = self.nodes.remove(id) else {
            return;
        };

        node.shutdown().await;
        self.hub.disconnect(id);
        self.cluster.leave(id);
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<GridNode>> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Running nodes, in node-id order.
    pub fn nodes(&self) -> Vec<Arc<GridNode>> {
        let mut nodes: Vec<Arc<GridNode>> =
            self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn shutdown(&self) {
        for node in self.nodes() {
            self.stop_node(node.id()).await;
        }
    }
}
