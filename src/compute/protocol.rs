//! Compute wire messages carried inside [`crate::messaging::envelope::Envelope`].

use super::types::{JobId, JobResult, JobSpec, SessionId, SiblingRecord};
use crate::cluster::types::NodeId;

use serde::{Deserialize, Serialize};

/// Sent by the task's origin to the node chosen for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJobRequest {
    pub session_id: SessionId,
    pub origin: NodeId,
    pub task_name: String,
    pub job_id: JobId,
    /// Bumped on every failover; responses for older attempts are stale.
    pub attempt: u32,
    pub spec: JobSpec,
    /// Complete sibling set, this job included.
    pub siblings: Vec<SiblingRecord>,
}

/// Sent back to the origin once per job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub attempt: u32,
    pub result: JobResult,
}
