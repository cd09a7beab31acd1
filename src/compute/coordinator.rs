//! Task Execution Coordinator
//!
//! One actor per submitted task, running on the submitting node. It owns the
//! `Splitting -> Scheduled -> Collecting -> Reducing` lifecycle and is the only writer of
//! the task's session state. Everything that can happen to a task while it is collecting
//! (a result arriving, a sibling cancel, an owner leaving, an external cancel) is a
//! [`TaskEvent`] on one unbounded channel, so the result policy is folded one event at a
//! time no matter how many nodes report concurrently.

use super::processor::ComputeContext;
use super::protocol::{ExecuteJobRequest, JobResponse};
use super::session::TaskSession;
use super::task::ComputeTask;
use super::types::{JobId, JobResult, JobSpec, ResultPolicy, SiblingRecord, TaskOutcome, TaskState};
use crate::cluster::types::NodeId;
use crate::error::{FabricError, Result};
use crate::messaging::envelope::Envelope;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) enum TaskEvent {
    Response { from: NodeId, response: JobResponse },
    CancelSibling(JobId),
    NodeLeft(NodeId),
    Cancel,
}

struct JobSlot {
    job_id: JobId,
    spec: JobSpec,
    owner: NodeId,
    attempt: u32,
    failovers: u32,
    result: Option<JobResult>,
    cancel_requested: bool,
}

enum Step {
    Continue,
    Reduce,
    Cancelled,
    Fail(FabricError),
}

pub(crate) struct TaskExecutionCoordinator {
    task: Arc<dyn ComputeTask>,
    arg: Option<Value>,
    session: Arc<TaskSession>,
    ctx: Arc<ComputeContext>,
    /// Feeds synthesized results (failed dispatch, unreachable owner) back into the stream.
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    state: watch::Sender<TaskState>,
    slots: Vec<JobSlot>,
    index: HashMap<JobId, usize>,
    /// Arrival order, as seen by the result policy.
    received: Vec<JobResult>,
    timeout: Option<Duration>,
}

impl TaskExecutionCoordinator {
    pub(crate) fn new(
        task: Arc<dyn ComputeTask>,
        arg: Option<Value>,
        session: Arc<TaskSession>,
        ctx: Arc<ComputeContext>,
        events_tx: mpsc::UnboundedSender<TaskEvent>,
        state: watch::Sender<TaskState>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            task,
            arg,
            session,
            ctx,
            events_tx,
            state,
            slots: Vec::new(),
            index: HashMap::new(),
            received: Vec::new(),
            timeout,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
        outcome_tx: oneshot::Sender<Result<TaskOutcome>>,
    ) {
        let outcome = self.execute(&mut events).await;

        let terminal = match &outcome {
            Ok(TaskOutcome::Completed(_)) => TaskState::Completed,
            Ok(TaskOutcome::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        self.transition(terminal);

        match &outcome {
            Ok(TaskOutcome::Completed(_)) => tracing::info!("Task {} completed", self.session.id()),
            Ok(TaskOutcome::Cancelled) => tracing::info!("Task {} cancelled", self.session.id()),
            Err(e) => tracing::warn!("Task {} failed: {}", self.session.id(), e),
        }

        if outcome_tx.send(outcome).is_err() {
            tracing::debug!("Submitter of task {} no longer waiting", self.session.id());
        }

        self.await_cancel_acks(&mut events).await;
    }

    async fn execute(&mut self, events: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Result<TaskOutcome> {
        self.transition(TaskState::Splitting);

        let members: Vec<NodeId> = self.ctx.cluster.members().into_iter().collect();
        let specs = self
            .task
            .split(members.len(), self.arg.as_ref())
            .map_err(|e| FabricError::Split(format!("{e:#}")))?;

        tracing::info!(
            "Task {} ({}) split into {} job(s) over {} node(s)",
            self.session.id(),
            self.task.name(),
            specs.len(),
            members.len()
        );

        if specs.is_empty() {
            return self.reduce();
        }

        self.assign(specs, &members)?;
        self.transition(TaskState::Scheduled);

        for index in 0..self.slots.len() {
            self.dispatch(index);
        }
        self.transition(TaskState::Collecting);

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = expire(deadline) => {
                    self.cancel_outstanding();
                    return Err(FabricError::Timeout(format!(
                        "task {} exceeded {:?}",
                        self.session.id(),
                        self.timeout.unwrap_or_default()
                    )));
                }
            };

            let step = match event {
                Some(TaskEvent::Response { from, response }) => self.on_response(from, response),
                Some(TaskEvent::CancelSibling(job_id)) => self.on_cancel_sibling(&job_id),
                Some(TaskEvent::NodeLeft(node)) => self.on_node_left(&node),
                Some(TaskEvent::Cancel) | None => Step::Cancelled,
            };

            match step {
                Step::Continue if self.all_done() => return self.reduce(),
                Step::Continue => {}
                Step::Reduce => {
                    self.cancel_outstanding();
                    return self.reduce();
                }
                Step::Cancelled => {
                    self.cancel_outstanding();
                    return Ok(TaskOutcome::Cancelled);
                }
                Step::Fail(err) => {
                    self.cancel_outstanding();
                    return Err(err);
                }
            }
        }
    }

    /// Picks an owner for every job and fixes the sibling set before anything is sent.
    fn assign(&mut self, specs: Vec<JobSpec>, members: &[NodeId]) -> Result<()> {
        let mut records = Vec::with_capacity(specs.len());

        for spec in specs {
            let owner = self
                .ctx
                .balancer
                .select(members, &[])
                .ok_or_else(|| FabricError::Split("no live node to schedule on".to_string()))?;
            let job_id = JobId::new();

            records.push(SiblingRecord {
                job_id: job_id.clone(),
                owner: owner.clone(),
            });
            self.index.insert(job_id.clone(), self.slots.len());
            self.slots.push(JobSlot {
                job_id,
                spec,
                owner,
                attempt: 0,
                failovers: 0,
                result: None,
                cancel_requested: false,
            });
        }

        self.session.register_siblings(&records);
        Ok(())
    }

    fn dispatch(&self, index: usize) {
        let slot = &self.slots[index];
        let request = ExecuteJobRequest {
            session_id: self.session.id().clone(),
            origin: self.session.origin().clone(),
            task_name: self.task.name().to_string(),
            job_id: slot.job_id.clone(),
            attempt: slot.attempt,
            spec: slot.spec.clone(),
            siblings: self.session.siblings(),
        };

        tracing::debug!(
            "Scheduling job {} of task {} on {} (attempt {})",
            slot.job_id,
            self.session.id(),
            slot.owner,
            slot.attempt
        );

        let channel = self.ctx.channel.clone();
        let events = self.events_tx.clone();
        let owner = slot.owner.clone();

        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            let job_id = request.job_id.clone();
            let attempt = request.attempt;

            if let Err(e) = channel.send(&owner, Envelope::ExecuteJob(request)).await {
                tracing::warn!("Failed to send job {} to {}: {}", job_id, owner, e);
                let result = JobResult::failure(job_id.clone(), owner.clone(), e.to_string());
                let _ = events.send(TaskEvent::Response {
                    from: owner,
                    response: JobResponse {
                        session_id,
                        job_id,
                        attempt,
                        result,
                    },
                });
            }
        });
    }

    fn send_cancel(&self, index: usize) {
        let slot = &self.slots[index];
        let envelope = Envelope::CancelJob {
            session_id: self.session.id().clone(),
            job_id: slot.job_id.clone(),
        };

        tracing::debug!("Cancelling job {} on {}", slot.job_id, slot.owner);

        let channel = self.ctx.channel.clone();
        let events = self.events_tx.clone();
        let owner = slot.owner.clone();
        let session_id = self.session.id().clone();
        let job_id = slot.job_id.clone();
        let attempt = slot.attempt;

        tokio::spawn(async move {
            if let Err(e) = channel.send(&owner, envelope).await {
                // Nobody is left to run the job: it is as good as cancelled.
                tracing::warn!("Cancel of job {} could not reach {}: {}", job_id, owner, e);
                let _ = events.send(TaskEvent::Response {
                    from: owner.clone(),
                    response: JobResponse {
                        session_id,
                        job_id: job_id.clone(),
                        attempt,
                        result: JobResult::cancelled(job_id, owner),
                    },
                });
            }
        });
    }

    fn on_response(&mut self, from: NodeId, response: JobResponse) -> Step {
        let Some(&index) = self.index.get(&response.job_id) else {
            tracing::debug!("Result for unknown job {} from {}", response.job_id, from);
            return Step::Continue;
        };

        let slot = &self.slots[index];
        if response.attempt != slot.attempt || slot.result.is_some() {
            tracing::debug!(
                "Discarding stale result for job {} (attempt {}, current {})",
                response.job_id,
                response.attempt,
                slot.attempt
            );
            return Step::Continue;
        }

        self.accept(index, response.result)
    }

    /// Folds one result into the policy. The only place a slot gets its result.
    fn accept(&mut self, index: usize, result: JobResult) -> Step {
        tracing::debug!(
            "Job {} reported (error: {}, cancelled: {})",
            result.job_id,
            result.is_error(),
            result.cancelled
        );

        self.slots[index].result = Some(result.clone());
        self.received.push(result.clone());

        match self.task.result(&result, &self.received) {
            ResultPolicy::Wait => Step::Continue,
            ResultPolicy::Reduce => {
                tracing::info!("Task {} reducing early", self.session.id());
                Step::Reduce
            }
            ResultPolicy::Failover if result.cancelled || self.slots[index].cancel_requested => {
                tracing::debug!("Not failing over cancelled job {}", result.job_id);
                Step::Continue
            }
            ResultPolicy::Failover => {
                self.received.pop();
                self.slots[index].result = None;

                if self.slots[index].failovers >= self.ctx.config.max_failover_attempts {
                    return Step::Fail(FabricError::JobExecution {
                        job_id: result.job_id.clone(),
                        message: result
                            .error
                            .unwrap_or_else(|| "failover attempts exhausted".to_string()),
                    });
                }

                self.failover(index)
            }
        }
    }

    fn failover(&mut self, index: usize) -> Step {
        let members: Vec<NodeId> = self.ctx.cluster.members().into_iter().collect();
        let previous = self.slots[index].owner.clone();

        let Some(next) = self.ctx.balancer.select(&members, std::slice::from_ref(&previous)) else {
            return Step::Fail(FabricError::JobExecution {
                job_id: self.slots[index].job_id.clone(),
                message: "no live node to fail over to".to_string(),
            });
        };

        let slot = &mut self.slots[index];
        slot.owner = next.clone();
        slot.attempt += 1;
        slot.failovers += 1;

        tracing::warn!(
            "Failing over job {} from {} to {} (attempt {})",
            slot.job_id,
            previous,
            next,
            slot.attempt
        );

        self.session.set_owner(&slot.job_id, next);
        self.dispatch(index);
        Step::Continue
    }

    fn on_cancel_sibling(&mut self, job_id: &JobId) -> Step {
        let Some(&index) = self.index.get(job_id) else {
            tracing::debug!("Cancel for unknown sibling {}", job_id);
            return Step::Continue;
        };

        let slot = &mut self.slots[index];
        if slot.result.is_some() || slot.cancel_requested {
            return Step::Continue;
        }

        slot.cancel_requested = true;
        self.send_cancel(index);
        Step::Continue
    }

    fn on_node_left(&mut self, node: &NodeId) -> Step {
        let orphaned: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.owner == *node && slot.result.is_none())
            .map(|(index, _)| index)
            .collect();

        if !orphaned.is_empty() {
            tracing::warn!(
                "Node {} left with {} job(s) of task {} outstanding",
                node,
                orphaned.len(),
                self.session.id()
            );
        }

        for index in orphaned {
            let slot = &self.slots[index];
            let result = if slot.cancel_requested {
                JobResult::cancelled(slot.job_id.clone(), node.clone())
            } else {
                JobResult::failure(slot.job_id.clone(), node.clone(), format!("node {} left", node))
            };

            match self.accept(index, result) {
                Step::Continue => {}
                step => return step,
            }
        }

        Step::Continue
    }

    fn all_done(&self) -> bool {
        self.slots.iter().all(|slot| slot.result.is_some())
    }

    fn cancel_outstanding(&mut self) {
        let pending: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.result.is_none() && !slot.cancel_requested)
            .map(|(index, _)| index)
            .collect();

        for index in pending {
            self.slots[index].cancel_requested = true;
            self.send_cancel(index);
        }
    }

    fn reduce(&mut self) -> Result<TaskOutcome> {
        self.transition(TaskState::Reducing);

        let results: Vec<JobResult> = self
            .slots
            .iter()
            .filter_map(|slot| slot.result.clone())
            .collect();

        tracing::debug!("Reducing task {} over {} result(s)", self.session.id(), results.len());

        self.task
            .reduce(&results)
            .map(TaskOutcome::Completed)
            .map_err(|e| FabricError::Reduce(format!("{e:#}")))
    }

    /// Gives cancelled jobs a bounded time to report back. Missing reports are logged;
    /// a remote job cannot be forced to stop.
    async fn await_cancel_acks(&mut self, events: &mut mpsc::UnboundedReceiver<TaskEvent>) {
        let mut pending: HashSet<JobId> = self
            .slots
            .iter()
            .filter(|slot| slot.cancel_requested && slot.result.is_none())
            .map(|slot| slot.job_id.clone())
            .collect();

        if pending.is_empty() {
            return;
        }

        let wait = self.ctx.config.cancel_ack_timeout();
        let deadline = Instant::now() + wait;

        while !pending.is_empty() {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => break,
            };

            match event {
                Some(TaskEvent::Response { response, .. }) => {
                    let current = self
                        .index
                        .get(&response.job_id)
                        .map(|&index| self.slots[index].attempt);
                    if current == Some(response.attempt) {
                        pending.remove(&response.job_id);
                    }
                }
                Some(TaskEvent::NodeLeft(node)) => {
                    let gone: Vec<JobId> = self
                        .slots
                        .iter()
                        .filter(|slot| slot.owner == node)
                        .map(|slot| slot.job_id.clone())
                        .collect();
                    for job_id in gone {
                        pending.remove(&job_id);
                    }
                }
                Some(_) => {}
                None => return,
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                "Task {}: {} cancelled job(s) did not acknowledge within {:?}",
                self.session.id(),
                pending.len(),
                wait
            );
        }
    }

    fn transition(&self, next: TaskState) {
        let previous = self.state.send_replace(next);
        tracing::debug!("Task {} {:?} -> {:?}", self.session.id(), previous, next);
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
