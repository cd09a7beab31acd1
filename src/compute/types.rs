use crate::cluster::types::NodeId;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one job, unique within its task. Stable across failovers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job as produced by `split`: a registered job type plus its argument, so that
/// whichever node it lands on can instantiate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub arg: Value,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, arg: Value) -> Self {
        Self {
            job_type: job_type.into(),
            arg,
        }
    }
}

/// Outcome of one job attempt.
///
/// `cancelled` is orthogonal to value/error: a job that noticed cancellation and
/// returned early still reports whatever it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl JobResult {
    pub fn success(job_id: JobId, node_id: NodeId, value: Value) -> Self {
        Self {
            job_id,
            node_id,
            value: Some(value),
            error: None,
            cancelled: false,
        }
    }

    pub fn failure(job_id: JobId, node_id: NodeId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            node_id,
            value: None,
            error: Some(error.into()),
            cancelled: false,
        }
    }

    /// Result of a job that was cancelled before it produced anything.
    pub fn cancelled(job_id: JobId, node_id: NodeId) -> Self {
        Self {
            job_id,
            node_id,
            value: None,
            error: None,
            cancelled: true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Decision returned by a task after each result arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultPolicy {
    /// Keep collecting.
    Wait,
    /// Reduce now; outstanding jobs are cancelled.
    Reduce,
    /// Reschedule the job on another node. Ignored for cancelled jobs. Once a job has
    /// been failed over `max_failover_attempts` times, the next `Failover` fails the
    /// whole task with [`FabricError::JobExecution`](crate::error::FabricError::JobExecution)
    /// instead of keeping the error in the result set.
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Splitting,
    Scheduled,
    Collecting,
    Reducing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// What a task's future resolves to when it did not fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed(Value),
    Cancelled,
}

impl TaskOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            TaskOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// Wire form of a sibling: which job, and which node currently owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingRecord {
    pub job_id: JobId,
    pub owner: NodeId,
}
