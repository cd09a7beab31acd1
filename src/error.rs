//! Fabric Error Taxonomy
//!
//! Every public fabric operation reports failures through [`FabricError`]. User code
//! (job bodies, split/reduce functions, service methods) returns `anyhow::Result` and is
//! translated into this taxonomy at the fabric boundary.
//!
//! Cancellation is deliberately absent: a cancelled task completes with
//! `TaskOutcome::Cancelled`, never with an error.

use crate::cluster::types::NodeId;
use crate::compute::types::JobId;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum FabricError {
    /// A public entry point was called with a missing or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task split failed: {0}")]
    Split(String),

    #[error("job {job_id} failed: {message}")]
    JobExecution { job_id: JobId, message: String },

    #[error("task reduce failed: {0}")]
    Reduce(String),

    #[error("no job type registered under '{0}'")]
    UnknownJobType(String),

    #[error("service '{0}' is already deployed with a different descriptor")]
    DuplicateService(String),

    #[error("no instance of service '{0}' is deployed")]
    NoServiceInstance(String),

    /// The resolved target stopped answering. The caller may retry.
    #[error("service '{name}' on node {node} is unavailable: {reason}")]
    ServiceUnavailable {
        name: String,
        node: NodeId,
        reason: String,
    },

    /// The remote service method itself returned an error.
    #[error("{0}")]
    ServiceInvocation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FabricError {
    /// Converts an error raised by a message handler back into the taxonomy.
    ///
    /// Handlers return `anyhow::Result`; if the underlying error already is a
    /// `FabricError` it is preserved, otherwise it becomes a transport error.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<FabricError>() {
            Ok(fabric) => fabric,
            Err(other) => FabricError::Transport(other.to_string()),
        }
    }

    /// True for failures that mean "the other side is gone or did not answer".
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            FabricError::NodeUnreachable(_) | FabricError::Timeout(_) | FabricError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
