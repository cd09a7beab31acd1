//! Job Registry
//!
//! Maps job type names (e.g. "echo") to factories, so a job described by a
//! [`JobSpec`](super::types::JobSpec) can be instantiated on whichever node it lands on.

use super::session::JobSession;
use super::types::JobId;
use crate::cluster::types::NodeId;
use crate::error::{FabricError, Result as FabricResult};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One schedulable unit of work.
///
/// Cancellation is cooperative: `execute` is expected to watch
/// [`JobContext::is_cancelled`] or await [`JobContext::cancelled`]. A job that ignores
/// the signal simply runs to completion.
#[async_trait]
pub trait ComputeJob: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<Value>;

    /// Invoked once when a cancel reaches the job while it is running.
    fn cancel(&self) {}
}

/// Execution context handed to [`ComputeJob::execute`].
pub struct JobContext {
    job_id: JobId,
    argument: Value,
    node_id: NodeId,
    session: Arc<JobSession>,
    token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        argument: Value,
        node_id: NodeId,
        session: Arc<JobSession>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            argument,
            node_id,
            session,
            token,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn argument(&self) -> &Value {
        &self.argument
    }

    /// Node this job is executing on.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn session(&self) -> &Arc<JobSession> {
        &self.session
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

pub type JobHandlerFn =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A job backed by an async closure and no cancel hook.
pub struct FnJob {
    handler: JobHandlerFn,
}

#[async_trait]
impl ComputeJob for FnJob {
    async fn execute(&self, ctx: JobContext) -> Result<Value> {
        (self.handler)(ctx).await
    }
}

pub type JobFactory = Arc<dyn Fn() -> Arc<dyn ComputeJob> + Send + Sync>;

pub struct JobRegistry {
    factories: DashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a factory producing a fresh job instance per execution.
    pub fn register<F, J>(&self, job_type: &str, factory: F)
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: ComputeJob + 'static,
    {
        let factory_fn: JobFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn ComputeJob>);
        self.factories.insert(job_type.to_string(), factory_fn);

        tracing::info!("Registered job type: {}", job_type);
    }

    /// Registers a closure-backed job type.
    pub fn register_fn<F, Fut>(&self, job_type: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler_fn: JobHandlerFn = Arc::new(move |ctx: JobContext| {
            Box::pin(handler(ctx)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.factories.insert(
            job_type.to_string(),
            Arc::new(move || {
                Arc::new(FnJob {
                    handler: handler_fn.clone(),
                }) as Arc<dyn ComputeJob>
            }),
        );

        tracing::info!("Registered job type: {}", job_type);
    }

    pub fn instantiate(&self, job_type: &str) -> FabricResult<Arc<dyn ComputeJob>> {
        let factory = self
            .factories
            .get(job_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FabricError::UnknownJobType(job_type.to_string()))?;

        Ok(factory())
    }

    pub fn has_job_type(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        self.factories.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }
}
