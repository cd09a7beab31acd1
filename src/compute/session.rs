//! Task sessions and sibling handles.
//!
//! A [`TaskSession`] lives on the task's origin node and is the single owner of the
//! sibling registry, the attribute map and the list of task-scoped checkpoints. Jobs see
//! it through a [`JobSession`], which talks to the origin over the message channel and
//! never shares memory with it.

use super::types::{JobId, SessionId, SiblingRecord};
use crate::checkpoint::{CheckpointRequest, CheckpointScope, CheckpointStores};
use crate::cluster::types::NodeId;
use crate::error::{FabricError, Result};
use crate::messaging::channel::{MessageChannel, unexpected_reply};
use crate::messaging::envelope::Envelope;

use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

/// Origin-side state of one task execution.
pub struct TaskSession {
    id: SessionId,
    task_name: String,
    origin: NodeId,
    /// Job ids in submission order; set exactly once, after splitting.
    jobs: OnceLock<Vec<JobId>>,
    owners: DashMap<JobId, NodeId>,
    attributes: DashMap<String, Value>,
    /// Task-scoped checkpoints reported by jobs: key -> store selector.
    checkpoints: DashMap<String, Option<String>>,
}

impl TaskSession {
    pub(crate) fn new(id: SessionId, task_name: String, origin: NodeId) -> Self {
        Self {
            id,
            task_name,
            origin,
            jobs: OnceLock::new(),
            owners: DashMap::new(),
            attributes: DashMap::new(),
            checkpoints: DashMap::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    /// Fixes the sibling set. Returns false if it was already fixed.
    pub(crate) fn register_siblings(&self, records: &[SiblingRecord]) -> bool {
        if self.jobs.get().is_some() {
            return false;
        }

        for record in records {
            self.owners.insert(record.job_id.clone(), record.owner.clone());
        }
        self.jobs
            .set(records.iter().map(|record| record.job_id.clone()).collect())
            .is_ok()
    }

    /// Current sibling set in submission order; empty until splitting completes.
    pub fn siblings(&self) -> Vec<SiblingRecord> {
        let Some(jobs) = self.jobs.get() else {
            return Vec::new();
        };

        jobs.iter()
            .filter_map(|job_id| {
                self.owners.get(job_id).map(|owner| SiblingRecord {
                    job_id: job_id.clone(),
                    owner: owner.value().clone(),
                })
            })
            .collect()
    }

    pub fn sibling_count(&self) -> usize {
        self.jobs.get().map_or(0, Vec::len)
    }

    pub fn owner(&self, job_id: &JobId) -> Option<NodeId> {
        self.owners.get(job_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn set_owner(&self, job_id: &JobId, owner: NodeId) {
        if let Some(mut entry) = self.owners.get_mut(job_id) {
            *entry = owner;
        }
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key).map(|entry| entry.value().clone())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub(crate) fn record_checkpoint(&self, key: String, store: Option<String>) {
        self.checkpoints.insert(key, store);
    }

    pub fn checkpoint_keys(&self) -> Vec<(String, Option<String>)> {
        self.checkpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Remote handle on a job of the same task.
///
/// Cancelling goes through the task's origin, which knows the job's current owner
/// even after a failover.
#[derive(Clone)]
pub struct JobSibling {
    record: SiblingRecord,
    session_id: SessionId,
    origin: NodeId,
    channel: Arc<dyn MessageChannel>,
}

impl JobSibling {
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    /// Owner at the time this handle was obtained.
    pub fn owner(&self) -> &NodeId {
        &self.record.owner
    }

    /// Requests cancellation. Never blocks and never fails; repeated calls are no-ops
    /// on the receiving side.
    pub fn cancel(&self) {
        let channel = self.channel.clone();
        let origin = self.origin.clone();
        let envelope = Envelope::CancelSibling {
            session_id: self.session_id.clone(),
            job_id: self.record.job_id.clone(),
        };
        let job_id = self.record.job_id.clone();

        tokio::spawn(async move {
            if let Err(e) = channel.send(&origin, envelope).await {
                tracing::warn!("Failed to request cancel of sibling {}: {}", job_id, e);
            }
        });
    }
}

impl fmt::Debug for JobSibling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSibling")
            .field("job_id", &self.record.job_id)
            .field("owner", &self.record.owner)
            .finish()
    }
}

/// A job's view of its task session.
pub struct JobSession {
    session_id: SessionId,
    job_id: JobId,
    origin: NodeId,
    siblings: Mutex<Vec<SiblingRecord>>,
    channel: Arc<dyn MessageChannel>,
    checkpoints: Arc<CheckpointStores>,
    /// Job-scoped checkpoints to drop when the job finishes: (store, key).
    job_checkpoints: Mutex<Vec<(Option<String>, String)>>,
    request_timeout: Duration,
}

impl JobSession {
    pub(crate) fn new(
        session_id: SessionId,
        job_id: JobId,
        origin: NodeId,
        siblings: Vec<SiblingRecord>,
        channel: Arc<dyn MessageChannel>,
        checkpoints: Arc<CheckpointStores>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            job_id,
            origin,
            siblings: Mutex::new(siblings),
            channel,
            checkpoints,
            job_checkpoints: Mutex::new(Vec::new()),
            request_timeout,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Node the task was submitted on.
    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    /// Every job of the task, this one included, in submission order.
    pub fn siblings(&self) -> Vec<JobSibling> {
        self.siblings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|record| self.handle(record.clone()))
            .collect()
    }

    pub fn sibling(&self, job_id: &JobId) -> Option<JobSibling> {
        self.siblings().into_iter().find(|sibling| sibling.job_id() == job_id)
    }

    /// Handle on the executing job itself.
    pub fn this_job(&self) -> Option<JobSibling> {
        self.sibling(&self.job_id)
    }

    /// Re-reads the sibling owners from the origin.
    pub async fn refresh_siblings(&self) -> Result<Vec<JobSibling>> {
        let reply = self
            .channel
            .request(
                &self.origin,
                Envelope::SiblingsRequest {
                    session_id: self.session_id.clone(),
                },
                self.request_timeout,
            )
            .await?;

        let Envelope::Siblings { siblings } = reply else {
            return Err(unexpected_reply("Siblings", &reply));
        };

        *self.siblings.lock().unwrap_or_else(PoisonError::into_inner) = siblings;
        Ok(self.siblings())
    }

    pub async fn set_attribute(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.channel
            .request(
                &self.origin,
                Envelope::SetAttribute {
                    session_id: self.session_id.clone(),
                    key: key.into(),
                    value,
                },
                self.request_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn attribute(&self, key: &str) -> Result<Option<Value>> {
        let reply = self
            .channel
            .request(
                &self.origin,
                Envelope::GetAttribute {
                    session_id: self.session_id.clone(),
                    key: key.to_string(),
                },
                self.request_timeout,
            )
            .await?;

        match reply {
            Envelope::Attribute { value } => Ok(value),
            other => Err(unexpected_reply("Attribute", &other)),
        }
    }

    /// Saves into the default store.
    pub async fn save_checkpoint(&self, key: &str, blob: Vec<u8>, scope: CheckpointScope) -> Result<()> {
        self.save_checkpoint_in(None, key, blob, scope).await
    }

    pub async fn save_checkpoint_in(
        &self,
        store: Option<&str>,
        key: &str,
        blob: Vec<u8>,
        scope: CheckpointScope,
    ) -> Result<()> {
        let request = CheckpointRequest::new(
            self.session_id.clone(),
            key,
            store.map(str::to_string),
        )?;
        let target = self.checkpoints.resolve(request.store.as_deref())?;

        target
            .save(&self.session_id, key, blob, scope)
            .await
            .map_err(|e| FabricError::Transport(format!("checkpoint save failed: {e:#}")))?;

        match scope {
            CheckpointScope::Job => {
                self.job_checkpoints
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((request.store, request.key));
            }
            CheckpointScope::Task => {
                self.channel
                    .request(&self.origin, Envelope::Checkpoint(request), self.request_timeout)
                    .await?;
            }
        }

        tracing::debug!("Job {} saved checkpoint '{}' ({:?} scope)", self.job_id, key, scope);
        Ok(())
    }

    pub async fn load_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.load_checkpoint_from(None, key).await
    }

    pub async fn load_checkpoint_from(&self, store: Option<&str>, key: &str) -> Result<Option<Vec<u8>>> {
        let request = CheckpointRequest::new(self.session_id.clone(), key, store.map(str::to_string))?;

        self.checkpoints
            .resolve(request.store.as_deref())?
            .load(&self.session_id, key)
            .await
            .map_err(|e| FabricError::Transport(format!("checkpoint load failed: {e:#}")))
    }

    pub async fn remove_checkpoint(&self, key: &str) -> Result<bool> {
        self.remove_checkpoint_from(None, key).await
    }

    pub async fn remove_checkpoint_from(&self, store: Option<&str>, key: &str) -> Result<bool> {
        let request = CheckpointRequest::new(self.session_id.clone(), key, store.map(str::to_string))?;

        self.job_checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(s, k)| !(k == &request.key && s == &request.store));

        self.checkpoints
            .resolve(request.store.as_deref())?
            .remove(&self.session_id, key)
            .await
            .map_err(|e| FabricError::Transport(format!("checkpoint remove failed: {e:#}")))
    }

    /// Drops every job-scoped checkpoint this job saved.
    pub(crate) async fn release_job_checkpoints(&self) {
        let owned: Vec<(Option<String>, String)> = std::mem::take(
            &mut *self
                .job_checkpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (store, key) in owned {
            let removed = match self.checkpoints.resolve(store.as_deref()) {
                Ok(target) => target.remove(&self.session_id, &key).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = removed {
                tracing::warn!("Failed to drop job checkpoint '{}' of {}: {}", key, self.job_id, e);
            }
        }
    }

    fn handle(&self, record: SiblingRecord) -> JobSibling {
        JobSibling {
            record,
            session_id: self.session_id.clone(),
            origin: self.origin.clone(),
            channel: self.channel.clone(),
        }
    }
}
