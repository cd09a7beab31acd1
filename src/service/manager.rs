//! Service Deployment Manager
//!
//! One per node. The live member with the smallest node id acts as deployment
//! coordinator: it owns the authoritative [`AssignmentTable`], serialises every change
//! to it, and pushes each new version to all members, waiting for their
//! acknowledgements. Every node keeps a replica of the table (proxies route from it) and
//! reconciles its local instances to the count the table assigns to it.
//!
//! A node taking over as coordinator first collects the replicas of its peers and
//! continues from the newest one. Two nodes that transiently both act as coordinator
//! publish tables with the same version; the one from the smaller coordinator id wins
//! everywhere, and instances that it does not assign are stopped, so a cluster
//! singleton converges to exactly one survivor.

use super::assignment::{AssignmentTable, ServiceAssignment, compute_assignment};
use super::types::{Service, ServiceContext, ServiceDescriptor, ServiceRegistry};
use crate::cluster::types::{MembershipEvent, NodeId};
use crate::cluster::view::ClusterView;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::messaging::channel::{MessageChannel, unexpected_reply};
use crate::messaging::envelope::Envelope;

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

struct LocalInstance {
    service: Arc<dyn Service>,
    ctx: Arc<ServiceContext>,
    handle: JoinHandle<()>,
}

impl Drop for LocalInstance {
    fn drop(&mut self) {
        // An instance is never detached: losing track of it stops it.
        self.handle.abort();
    }
}

pub struct ServiceDeploymentManager {
    local: NodeId,
    cluster: Arc<dyn ClusterView>,
    channel: Arc<dyn MessageChannel>,
    registry: Arc<ServiceRegistry>,
    config: FabricConfig,
    table: RwLock<AssignmentTable>,
    /// Serialises coordinator-side table mutations.
    coordinator_lock: Mutex<()>,
    /// Serialises starting and stopping of local instances.
    reconcile_lock: Mutex<()>,
    instances: DashMap<String, Vec<LocalInstance>>,
    stopped: AtomicBool,
}

impl ServiceDeploymentManager {
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        channel: Arc<dyn MessageChannel>,
        registry: Arc<ServiceRegistry>,
        config: FabricConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: cluster.local_node_id(),
            cluster,
            channel,
            registry,
            config,
            table: RwLock::new(AssignmentTable::default()),
            coordinator_lock: Mutex::new(()),
            reconcile_lock: Mutex::new(()),
            instances: DashMap::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterView> {
        &self.cluster
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Current deployment coordinator: the smallest live node id.
    pub fn coordinator(&self) -> NodeId {
        self.cluster
            .members()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.local.clone())
    }

    /// This node's replica of the assignment table.
    pub async fn table(&self) -> AssignmentTable {
        self.table.read().await.clone()
    }

    pub async fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.table
            .read()
            .await
            .services
            .values()
            .map(|assignment| assignment.descriptor.clone())
            .collect()
    }

    /// Deploys a service. Returns once every live member acknowledged the new table.
    pub async fn deploy(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate()?;
        if !self.registry.has_type(&descriptor.service_type) {
            return Err(FabricError::InvalidArgument(format!(
                "unknown service type '{}'",
                descriptor.service_type
            )));
        }

        let coordinator = self.coordinator();
        if coordinator == self.local {
            return self.deploy_as_coordinator(descriptor).await;
        }

        tracing::debug!("Forwarding deploy of {} to coordinator {}", descriptor.name, coordinator);
        let reply = self
            .channel
            .request(&coordinator, Envelope::Deploy(descriptor), self.config.undeploy_timeout())
            .await?;

        match reply {
            Envelope::Ack => Ok(()),
            other => Err(unexpected_reply("Ack", &other)),
        }
    }

    /// Undeploys a service, stopping every instance. A missing stop confirmation within
    /// the undeploy timeout is reported as [`FabricError::Timeout`].
    pub async fn undeploy(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FabricError::InvalidArgument("service name must not be empty".to_string()));
        }

        let coordinator = self.coordinator();
        if coordinator == self.local {
            return self.undeploy_as_coordinator(name).await;
        }

        let reply = self
            .channel
            .request(
                &coordinator,
                Envelope::Undeploy {
                    name: name.to_string(),
                },
                // Leave room for the coordinator's own bounded wait.
                self.config.undeploy_timeout() * 2,
            )
            .await?;

        match reply {
            Envelope::Ack => Ok(()),
            other => Err(unexpected_reply("Ack", &other)),
        }
    }

    pub async fn undeploy_all(&self) -> Result<()> {
        let names: Vec<String> = self.table.read().await.services.keys().cloned().collect();
        for name in names {
            self.undeploy(&name).await?;
        }
        Ok(())
    }

    async fn deploy_as_coordinator(&self, descriptor: ServiceDescriptor) -> Result<()> {
        let _guard = self.coordinator_lock.lock().await;
        let mut table = self.latest_table().await;

        if let Some(existing) = table.services.get(&descriptor.name) {
            if existing.descriptor == descriptor {
                tracing::debug!("Service {} already deployed with this descriptor", descriptor.name);
                return Ok(());
            }
            return Err(FabricError::DuplicateService(descriptor.name));
        }

        let eligible = descriptor.filter.nodes(self.cluster.as_ref());
        let nodes = compute_assignment(&descriptor, &eligible, None);

        tracing::info!(
            "Deploying service {} ({:?}) as {} instance(s) on {} node(s)",
            descriptor.name,
            descriptor.cardinality,
            nodes.values().sum::<usize>(),
            nodes.len()
        );

        table
            .services
            .insert(descriptor.name.clone(), ServiceAssignment { descriptor, nodes });

        for (node, e) in self.bump_and_publish(table, self.config.request_timeout()).await {
            tracing::warn!("Node {} did not acknowledge deployment: {}", node, e);
        }

        Ok(())
    }

    async fn undeploy_as_coordinator(&self, name: &str) -> Result<()> {
        let _guard = self.coordinator_lock.lock().await;
        let mut table = self.latest_table().await;

        if table.services.remove(name).is_none() {
            tracing::debug!("Service {} is not deployed", name);
            return Ok(());
        }

        tracing::info!("Undeploying service {}", name);

        // Local instances are stopped in full; only peer confirmations are bounded.
        let table = self.bump(table);
        self.apply(table.clone()).await;

        let timeout = self.config.undeploy_timeout();
        let failures = tokio::time::timeout(timeout, self.publish(table, timeout))
            .await
            .map_err(|_| FabricError::Timeout(format!("undeploy of '{}' after {:?}", name, timeout)))?;

        if !failures.is_empty() {
            let nodes: Vec<String> = failures.iter().map(|(node, _)| node.to_string()).collect();
            return Err(FabricError::Timeout(format!(
                "undeploy of '{}' not confirmed by {}",
                name,
                nodes.join(", ")
            )));
        }

        Ok(())
    }

    /// Recomputes every placement after a membership change. Only the coordinator acts.
    pub async fn handle_topology_change(&self) {
        if self.stopped.load(Ordering::SeqCst) || self.coordinator() != self.local {
            return;
        }

        let _guard = self.coordinator_lock.lock().await;
        let mut table = self.latest_table().await;

        for assignment in table.services.values_mut() {
            let eligible = assignment.descriptor.filter.nodes(self.cluster.as_ref());
            let nodes = compute_assignment(&assignment.descriptor, &eligible, Some(&assignment.nodes));
            if nodes != assignment.nodes {
                tracing::info!(
                    "Rebalancing service {}: {:?} -> {:?}",
                    assignment.descriptor.name,
                    assignment.nodes,
                    nodes
                );
                assignment.nodes = nodes;
            }
        }

        for (node, e) in self.bump_and_publish(table, self.config.request_timeout()).await {
            tracing::warn!("Node {} did not acknowledge rebalance: {}", node, e);
        }
    }

    /// Membership listener entry point; the work runs in the background.
    pub fn on_membership_event(self: &Arc<Self>, event: MembershipEvent) {
        tracing::debug!("Deployment manager on {} saw {:?}", self.local, event);
        let manager = self.clone();
        tokio::spawn(async move { manager.handle_topology_change().await });
    }

    /// Newest table known to this node or any live peer.
    async fn latest_table(&self) -> AssignmentTable {
        let mut best = self.table().await;
        let timeout = self.config.request_timeout();

        let mut requests = JoinSet::new();
        for node in self.cluster.members() {
            if node == self.local {
                continue;
            }
            let channel = self.channel.clone();
            requests.spawn(async move {
                let reply = channel.request(&node, Envelope::AssignmentRequest, timeout).await;
                (node, reply)
            });
        }

        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((_, Ok(Envelope::ApplyAssignment(table)))) if table.supersedes(&best) => best = table,
                Ok((_, Ok(_))) => {}
                Ok((node, Err(e))) => tracing::debug!("No assignment table from {}: {}", node, e),
                Err(e) => tracing::warn!("Assignment table request aborted: {}", e),
            }
        }

        best
    }

    fn bump(&self, mut table: AssignmentTable) -> AssignmentTable {
        table.version += 1;
        table.coordinator = Some(self.local.clone());

        tracing::info!("Publishing assignment table v{} ({} service(s))", table.version, table.services.len());
        table
    }

    async fn bump_and_publish(&self, table: AssignmentTable, timeout: Duration) -> Vec<(NodeId, FabricError)> {
        let table = self.bump(table);
        self.apply(table.clone()).await;
        self.publish(table, timeout).await
    }

    /// Pushes `table` to every live peer, returning the ones that did not acknowledge it.
    async fn publish(&self, table: AssignmentTable, timeout: Duration) -> Vec<(NodeId, FabricError)> {
        let mut requests = JoinSet::new();
        for node in self.cluster.members() {
            if node == self.local {
                continue;
            }
            let channel = self.channel.clone();
            let envelope = Envelope::ApplyAssignment(table.clone());
            requests.spawn(async move {
                let reply = channel.request(&node, envelope, timeout).await;
                (node, reply)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((node, Err(e))) => failures.push((node, e)),
                Err(e) => tracing::warn!("Assignment push aborted: {}", e),
            }
        }
        failures
    }

    /// Accepts `table` if it supersedes the replica, then reconciles local instances.
    pub async fn apply(&self, table: AssignmentTable) -> bool {
        {
            let mut current = self.table.write().await;
            if !table.supersedes(&current) {
                tracing::debug!(
                    "Ignoring assignment v{} from {:?} (have v{} from {:?})",
                    table.version,
                    table.coordinator,
                    current.version,
                    current.coordinator
                );
                return false;
            }
            *current = table;
        }

        self.reconcile_local().await;
        true
    }

    /// Starts or stops local instances until they match the table.
    async fn reconcile_local(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let table = self.table().await;
        let stopping = self.stopped.load(Ordering::SeqCst);

        let mut names: BTreeSet<String> = table.services.keys().cloned().collect();
        names.extend(self.instances.iter().map(|entry| entry.key().clone()));

        for name in names {
            let desired = if stopping { 0 } else { table.count_on(&name, &self.local) };
            let running = self.local_instance_count(&name);

            if running < desired {
                let Some(descriptor) = table.descriptor(&name) else {
                    continue;
                };
                for index in running..desired {
                    self.start_instance(descriptor, index).await;
                }
            } else if running > desired {
                let surplus = match self.instances.get_mut(&name) {
                    Some(mut list) => list.split_off(desired),
                    None => Vec::new(),
                };
                self.instances.remove_if(&name, |_, list| list.is_empty());

                for instance in surplus {
                    self.stop_instance(instance).await;
                }
            }
        }
    }

    async fn start_instance(&self, descriptor: &ServiceDescriptor, index: usize) {
        let service = match self.registry.create(&descriptor.service_type) {
            Ok(service) => service,
            Err(e) => {
                tracing::error!("Cannot start service {} on {}: {}", descriptor.name, self.local, e);
                return;
            }
        };

        let ctx = Arc::new(ServiceContext::new(
            descriptor.name.clone(),
            self.local.clone(),
            index,
            descriptor.config.clone(),
        ));

        if let Err(e) = service.init(&ctx).await {
            tracing::error!("Service {} failed to initialise on {}: {:#}", descriptor.name, self.local, e);
            return;
        }

        let runner = service.clone();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.execute(&run_ctx).await {
                tracing::warn!("Service {} execute ended with error: {:#}", run_ctx.name(), e);
            }
        });

        self.instances
            .entry(descriptor.name.clone())
            .or_default()
            .push(LocalInstance { service, ctx, handle });

        tracing::info!("Started service {} instance {} on {}", descriptor.name, index, self.local);
    }

    async fn stop_instance(&self, mut instance: LocalInstance) {
        instance.ctx.cancel_token();
        instance.service.cancel(&instance.ctx).await;

        let timeout = self.config.service_stop_timeout();
        if tokio::time::timeout(timeout, &mut instance.handle).await.is_err() {
            tracing::warn!(
                "Service {} did not stop within {:?} on {}; aborting",
                instance.ctx.name(),
                timeout,
                self.local
            );
            instance.handle.abort();
        }

        tracing::info!(
            "Stopped service {} instance {} on {}",
            instance.ctx.name(),
            instance.ctx.instance(),
            self.local
        );
    }

    /// Stops every local instance and refuses to start new ones.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _guard = self.reconcile_lock.lock().await;

        let names: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, list)) = self.instances.remove(&name) {
                for instance in list {
                    self.stop_instance(instance).await;
                }
            }
        }
    }

    pub fn local_instance(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.instances
            .get(name)
            .and_then(|list| list.first().map(|instance| instance.service.clone()))
    }

    pub fn local_instance_count(&self, name: &str) -> usize {
        self.instances.get(name).map_or(0, |list| list.len())
    }

    /// Calls `method` on an instance hosted by `target`.
    pub async fn invoke_remote(
        &self,
        target: &NodeId,
        name: &str,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let reply = self
            .channel
            .request(
                target,
                Envelope::ServiceInvoke {
                    name: name.to_string(),
                    method: method.to_string(),
                    args,
                },
                timeout,
            )
            .await?;

        match reply {
            Envelope::ServiceInvokeResponse { result } => result.map_err(FabricError::ServiceInvocation),
            other => Err(unexpected_reply("ServiceInvokeResponse", &other)),
        }
    }

    /// Receive side of [`Topic::Deployment`](crate::messaging::envelope::Topic::Deployment).
    pub async fn handle_deployment_message(
        &self,
        from: NodeId,
        envelope: Envelope,
    ) -> anyhow::Result<Option<Envelope>> {
        match envelope {
            Envelope::Deploy(descriptor) => {
                tracing::debug!("Deploy of {} forwarded by {}", descriptor.name, from);
                self.deploy_as_coordinator(descriptor).await?;
                Ok(Some(Envelope::Ack))
            }
            Envelope::Undeploy { name } => {
                tracing::debug!("Undeploy of {} forwarded by {}", name, from);
                self.undeploy_as_coordinator(&name).await?;
                Ok(Some(Envelope::Ack))
            }
            Envelope::ApplyAssignment(table) => {
                self.apply(table).await;
                Ok(Some(Envelope::Ack))
            }
            Envelope::AssignmentRequest => Ok(Some(Envelope::ApplyAssignment(self.table().await))),
            other => Err(anyhow::anyhow!("Unexpected {} on deployment topic", other.kind())),
        }
    }

    /// Receive side of [`Topic::Service`](crate::messaging::envelope::Topic::Service).
    pub async fn handle_service_message(&self, from: NodeId, envelope: Envelope) -> anyhow::Result<Option<Envelope>> {
        let Envelope::ServiceInvoke { name, method, args } = envelope else {
            return Err(anyhow::anyhow!("Unexpected {} on service topic", envelope.kind()));
        };

        let Some(service) = self.local_instance(&name) else {
            return Err(FabricError::NoServiceInstance(name).into());
        };

        tracing::trace!("Invoking {}.{} for {}", name, method, from);
        let result = service.invoke(&method, args).await.map_err(|e| e.to_string());

        Ok(Some(Envelope::ServiceInvokeResponse { result }))
    }
}
