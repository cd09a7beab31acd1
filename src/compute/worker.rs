//! Job Worker
//!
//! Executes jobs sent to this node and applies cancel requests to them:
//! - a cancel for a job that has not arrived yet leaves a tombstone, and the job is
//!   answered with a cancelled result without ever running;
//! - a cancel for a running job raises its token and runs its `cancel()` hook once;
//! - repeated cancels are no-ops, and so is a cancel for a job that already finished.
//!
//! Tombstones and finished keys are retained up to `tombstone_capacity`, evicted
//! oldest first.
//!
//! Each (job, attempt) produces exactly one response to the task's origin.

use super::job::{ComputeJob, JobContext, JobRegistry};
use super::processor::ComputeContext;
use super::protocol::{ExecuteJobRequest, JobResponse};
use super::session::JobSession;
use super::types::{JobId, JobResult, SessionId};
use crate::cluster::types::NodeId;
use crate::messaging::envelope::Envelope;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

enum JobEntry {
    /// Cancelled before it arrived.
    Tombstone,
    /// Answered; later deliveries of the same attempt and late cancels are ignored.
    Finished { attempt: u32 },
    Running {
        attempt: u32,
        token: CancellationToken,
        job: Arc<dyn ComputeJob>,
    },
}

enum Admission {
    Run(CancellationToken),
    Cancelled,
    Duplicate,
}

pub struct JobWorker {
    local: NodeId,
    registry: Arc<JobRegistry>,
    ctx: Arc<ComputeContext>,
    jobs: DashMap<(SessionId, JobId), JobEntry>,
    /// Tombstoned and finished keys, oldest first.
    retired: Mutex<VecDeque<(SessionId, JobId)>>,
}

impl JobWorker {
    pub fn new(registry: Arc<JobRegistry>, ctx: Arc<ComputeContext>) -> Arc<Self> {
        Arc::new(Self {
            local: ctx.channel.local_node_id(),
            registry,
            ctx,
            jobs: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| matches!(entry.value(), JobEntry::Running { .. }))
            .count()
    }

    pub fn is_tombstoned(&self, session_id: &SessionId, job_id: &JobId) -> bool {
        self.jobs
            .get(&(session_id.clone(), job_id.clone()))
            .is_some_and(|entry| matches!(entry.value(), JobEntry::Tombstone))
    }

    /// Receive side of [`Topic::Job`](crate::messaging::envelope::Topic::Job).
    pub async fn handle_message(self: &Arc<Self>, from: NodeId, envelope: Envelope) -> anyhow::Result<Option<Envelope>> {
        match envelope {
            Envelope::ExecuteJob(request) => {
                tracing::trace!("Job {} received from {}", request.job_id, from);
                self.execute(request);
                Ok(None)
            }
            Envelope::CancelJob { session_id, job_id } => {
                self.cancel(&session_id, &job_id);
                Ok(None)
            }
            other => Err(anyhow::anyhow!("Unexpected {} on job topic", other.kind())),
        }
    }

    /// Admits a job and runs it in the background.
    pub fn execute(self: &Arc<Self>, request: ExecuteJobRequest) {
        let job = match self.registry.instantiate(&request.spec.job_type) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Cannot run job {}: {}", request.job_id, e);
                let result = JobResult::failure(request.job_id.clone(), self.local.clone(), e.to_string());
                self.spawn_respond(&request, result);
                return;
            }
        };

        let key = (request.session_id.clone(), request.job_id.clone());
        let admission = match self.jobs.entry(key) {
            Entry::Occupied(mut entry) => {
                let known_attempt = match entry.get() {
                    JobEntry::Tombstone => None,
                    JobEntry::Finished { attempt } | JobEntry::Running { attempt, .. } => Some(*attempt),
                };

                match known_attempt {
                    None => {
                        // Key is already queued for eviction from its tombstone.
                        entry.insert(JobEntry::Finished {
                            attempt: request.attempt,
                        });
                        Admission::Cancelled
                    }
                    Some(attempt) if attempt >= request.attempt => Admission::Duplicate,
                    Some(_) => {
                        // Failed over back to this node while an older attempt still runs.
                        let token = CancellationToken::new();
                        entry.insert(JobEntry::Running {
                            attempt: request.attempt,
                            token: token.clone(),
                            job: job.clone(),
                        });
                        Admission::Run(token)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let token = CancellationToken::new();
                entry.insert(JobEntry::Running {
                    attempt: request.attempt,
                    token: token.clone(),
                    job: job.clone(),
                });
                Admission::Run(token)
            }
        };

        match admission {
            Admission::Run(token) => {
                let worker = self.clone();
                tokio::spawn(async move { worker.run(request, job, token).await });
            }
            Admission::Cancelled => {
                tracing::info!("Job {} was cancelled before it started", request.job_id);
                let result = JobResult::cancelled(request.job_id.clone(), self.local.clone());
                self.spawn_respond(&request, result);
            }
            Admission::Duplicate => {
                tracing::debug!("Ignoring duplicate delivery of job {}", request.job_id);
            }
        }
    }

    /// Applies a cancel request. Safe to call any number of times.
    pub fn cancel(&self, session_id: &SessionId, job_id: &JobId) {
        let mut tombstoned = false;

        let hook = match self.jobs.entry((session_id.clone(), job_id.clone())) {
            Entry::Occupied(entry) => match entry.get() {
                JobEntry::Running { token, job, .. } if !token.is_cancelled() => {
                    token.cancel();
                    Some(job.clone())
                }
                _ => None,
            },
            Entry::Vacant(entry) => {
                entry.insert(JobEntry::Tombstone);
                tombstoned = true;
                None
            }
        };

        if tombstoned {
            tracing::debug!("Job {} cancelled before arrival", job_id);
            self.retire((session_id.clone(), job_id.clone()));
        }

        // Hook runs with no map lock held.
        if let Some(job) = hook {
            tracing::info!("Cancelling running job {}", job_id);
            job.cancel();
        }
    }

    async fn run(self: Arc<Self>, request: ExecuteJobRequest, job: Arc<dyn ComputeJob>, token: CancellationToken) {
        let session = Arc::new(JobSession::new(
            request.session_id.clone(),
            request.job_id.clone(),
            request.origin.clone(),
            request.siblings.clone(),
            self.ctx.channel.clone(),
            self.ctx.checkpoints.clone(),
            self.ctx.config.request_timeout(),
        ));
        let ctx = JobContext::new(
            request.job_id.clone(),
            request.spec.arg.clone(),
            self.local.clone(),
            session.clone(),
            token.clone(),
        );

        tracing::info!(
            "Executing job {} ({}) of task {} (attempt {})",
            request.job_id,
            request.spec.job_type,
            request.session_id,
            request.attempt
        );

        // Nested spawn so a panicking job becomes an error result.
        let runner = job.clone();
        let outcome = tokio::spawn(async move { runner.execute(ctx).await }).await;

        let mut result = match outcome {
            Ok(Ok(value)) => JobResult::success(request.job_id.clone(), self.local.clone(), value),
            Ok(Err(e)) => JobResult::failure(request.job_id.clone(), self.local.clone(), format!("{e:#}")),
            Err(e) => JobResult::failure(request.job_id.clone(), self.local.clone(), format!("job panicked: {e}")),
        };
        result.cancelled = token.is_cancelled();

        let key = (request.session_id.clone(), request.job_id.clone());
        let finished = match self.jobs.get_mut(&key) {
            Some(mut entry) if matches!(*entry, JobEntry::Running { attempt, .. } if attempt == request.attempt) => {
                *entry = JobEntry::Finished {
                    attempt: request.attempt,
                };
                true
            }
            _ => false,
        };
        if finished {
            self.retire(key);
        }

        session.release_job_checkpoints().await;
        self.respond(&request, result).await;
    }

    fn spawn_respond(self: &Arc<Self>, request: &ExecuteJobRequest, result: JobResult) {
        let worker = self.clone();
        let request = request.clone();
        tokio::spawn(async move { worker.respond(&request, result).await });
    }

    async fn respond(&self, request: &ExecuteJobRequest, result: JobResult) {
        tracing::debug!(
            "Job {} finished (error: {}, cancelled: {})",
            request.job_id,
            result.is_error(),
            result.cancelled
        );

        let response = JobResponse {
            session_id: request.session_id.clone(),
            job_id: request.job_id.clone(),
            attempt: request.attempt,
            result,
        };

        if let Err(e) = self
            .ctx
            .channel
            .send(&request.origin, Envelope::JobResponse(response))
            .await
        {
            tracing::warn!("Failed to report job {} to {}: {}", request.job_id, request.origin, e);
        }
    }

    /// Queues a tombstoned or finished key and evicts the oldest ones past capacity.
    /// Must be called with no map guard held.
    fn retire(&self, key: (SessionId, JobId)) {
        let evicted: Vec<(SessionId, JobId)> = {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            retired.push_back(key);
            let excess = retired.len().saturating_sub(self.ctx.config.tombstone_capacity);
            retired.drain(..excess).collect()
        };

        for key in evicted {
            // A key failed over back to this node may be running again.
            if self
                .jobs
                .remove_if(&key, |_, entry| !matches!(entry, JobEntry::Running { .. }))
                .is_some()
            {
                tracing::trace!("Evicted job record {} of task {}", key.1, key.0);
            }
        }
    }
}
