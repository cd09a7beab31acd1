//! Task Processor
//!
//! Origin-side entry point for task execution on one node: validates submissions,
//! spawns one [`TaskExecutionCoordinator`] per task and routes everything addressed to a
//! live session (results, sibling cancels, attribute and sibling queries, checkpoint
//! registrations) to it.

use super::balancer::LoadBalancer;
use super::coordinator::{TaskEvent, TaskExecutionCoordinator};
use super::session::TaskSession;
use super::task::ComputeTask;
use super::types::{SessionId, TaskOutcome, TaskState};
use crate::checkpoint::CheckpointStores;
use crate::cluster::types::NodeId;
use crate::cluster::view::ClusterView;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::messaging::channel::MessageChannel;
use crate::messaging::envelope::Envelope;

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Collaborators shared by the compute side of a node.
pub struct ComputeContext {
    pub channel: Arc<dyn MessageChannel>,
    pub cluster: Arc<dyn ClusterView>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub checkpoints: Arc<CheckpointStores>,
    pub config: FabricConfig,
}

struct SessionHandle {
    session: Arc<TaskSession>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

pub struct TaskProcessor {
    ctx: Arc<ComputeContext>,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl TaskProcessor {
    pub fn new(ctx: Arc<ComputeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            sessions: DashMap::new(),
        })
    }

    /// Validates and starts a task. Argument errors are returned here, before any
    /// node is contacted; everything else is reported through the returned future.
    pub fn submit(
        self: &Arc<Self>,
        task: Arc<dyn ComputeTask>,
        arg: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<TaskFuture> {
        if task.requires_argument() && arg.as_ref().is_none_or(Value::is_null) {
            return Err(FabricError::InvalidArgument(format!(
                "task '{}' requires an argument",
                task.name()
            )));
        }

        let session_id = SessionId::new();
        let session = Arc::new(TaskSession::new(
            session_id.clone(),
            task.name().to_string(),
            self.ctx.channel.local_node_id(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(TaskState::Created);

        self.sessions.insert(
            session_id.clone(),
            SessionHandle {
                session: session.clone(),
                events: events_tx.clone(),
            },
        );

        tracing::info!("Submitted task {} ({})", session_id, task.name());

        let coordinator = TaskExecutionCoordinator::new(
            task,
            arg,
            session.clone(),
            self.ctx.clone(),
            events_tx.clone(),
            state_tx,
            timeout,
        );

        let processor = self.clone();
        let finished = session_id.clone();
        tokio::spawn(async move {
            coordinator.run(events_rx, outcome_tx).await;
            processor.finish_session(&finished).await;
        });

        Ok(TaskFuture {
            session,
            outcome: outcome_rx,
            cancel: TaskCancelHandle {
                session_id,
                events: events_tx,
            },
            state: state_rx,
        })
    }

    /// Cancels a running task. Returns false if the task is unknown or already gone.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.forward(session_id, TaskEvent::Cancel)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<TaskSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().session.clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Receive side of [`Topic::Task`](crate::messaging::envelope::Topic::Task).
    pub async fn handle_task_message(&self, from: NodeId, envelope: Envelope) -> anyhow::Result<Option<Envelope>> {
        match envelope {
            Envelope::JobResponse(response) => {
                let session_id = response.session_id.clone();
                if !self.forward(&session_id, TaskEvent::Response { from, response }) {
                    tracing::debug!("Result for finished task {} dropped", session_id);
                }
                Ok(None)
            }
            Envelope::CancelSibling { session_id, job_id } => {
                if !self.forward(&session_id, TaskEvent::CancelSibling(job_id)) {
                    tracing::debug!("Sibling cancel for finished task {} dropped", session_id);
                }
                Ok(None)
            }
            Envelope::SiblingsRequest { session_id } => Ok(Some(Envelope::Siblings {
                siblings: self.require(&session_id)?.siblings(),
            })),
            Envelope::SetAttribute {
                session_id,
                key,
                value,
            } => {
                self.require(&session_id)?.set_attribute(key, value);
                Ok(Some(Envelope::Ack))
            }
            Envelope::GetAttribute { session_id, key } => Ok(Some(Envelope::Attribute {
                value: self.require(&session_id)?.attribute(&key),
            })),
            other => Err(anyhow::anyhow!("Unexpected {} on task topic", other.kind())),
        }
    }

    /// Receive side of [`Topic::Checkpoint`](crate::messaging::envelope::Topic::Checkpoint).
    pub async fn handle_checkpoint_message(
        &self,
        from: NodeId,
        envelope: Envelope,
    ) -> anyhow::Result<Option<Envelope>> {
        let Envelope::Checkpoint(request) = envelope else {
            return Err(anyhow::anyhow!("Unexpected {} on checkpoint topic", envelope.kind()));
        };

        let session = self.require(&request.session_id)?;
        tracing::debug!(
            "Task {} registered checkpoint '{}' from {}",
            request.session_id,
            request.key,
            from
        );
        session.record_checkpoint(request.key, request.store);

        Ok(Some(Envelope::Ack))
    }

    /// Tells every live coordinator that `node` is gone.
    pub fn on_node_left(&self, node: &NodeId) {
        for entry in self.sessions.iter() {
            let _ = entry.value().events.send(TaskEvent::NodeLeft(node.clone()));
        }
    }

    fn forward(&self, session_id: &SessionId, event: TaskEvent) -> bool {
        match self.sessions.get(session_id) {
            Some(handle) => handle.events.send(event).is_ok(),
            None => false,
        }
    }

    fn require(&self, session_id: &SessionId) -> Result<Arc<TaskSession>> {
        self.session(session_id)
            .ok_or_else(|| FabricError::InvalidArgument(format!("unknown task session {}", session_id)))
    }

    /// Drops the session and every task-scoped checkpoint reported for it.
    async fn finish_session(&self, session_id: &SessionId) {
        let Some((_, handle)) = self.sessions.remove(session_id) else {
            return;
        };

        for (key, store) in handle.session.checkpoint_keys() {
            let removed = match self.ctx.checkpoints.resolve(store.as_deref()) {
                Ok(target) => target.remove(session_id, &key).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match removed {
                Ok(_) => tracing::debug!("Removed task checkpoint '{}' of {}", key, session_id),
                Err(e) => tracing::warn!("Failed to remove task checkpoint '{}' of {}: {}", key, session_id, e),
            }
        }
    }
}

/// Cancels a task without owning its future.
#[derive(Clone)]
pub struct TaskCancelHandle {
    session_id: SessionId,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskCancelHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Idempotent; a no-op once the task has finished.
    pub fn cancel(&self) {
        if self.events.send(TaskEvent::Cancel).is_err() {
            tracing::debug!("Task {} already finished", self.session_id);
        }
    }
}

/// Pending result of a submitted task.
pub struct TaskFuture {
    session: Arc<TaskSession>,
    outcome: oneshot::Receiver<Result<TaskOutcome>>,
    cancel: TaskCancelHandle,
    state: watch::Receiver<TaskState>,
}

impl TaskFuture {
    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<TaskSession> {
        &self.session
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> TaskCancelHandle {
        self.cancel.clone()
    }

    /// Waits for the task to finish.
    pub async fn get(self) -> Result<TaskOutcome> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(FabricError::Transport(
                "task coordinator stopped without an outcome".to_string(),
            ))
        })
    }
}
