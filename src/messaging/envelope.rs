use crate::checkpoint::CheckpointRequest;
use crate::compute::protocol::{ExecuteJobRequest, JobResponse};
use crate::compute::types::{JobId, SessionId, SiblingRecord};
use crate::error::FabricError;
use crate::service::assignment::AssignmentTable;
use crate::service::types::ServiceDescriptor;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message families; each topic has at most one handler per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Worker side of job execution.
    Job,
    /// Origin side of a task session.
    Task,
    Checkpoint,
    Service,
    Deployment,
    /// Responses; only meaningful as the return value of a request.
    Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    ExecuteJob(ExecuteJobRequest),
    CancelJob {
        session_id: SessionId,
        job_id: JobId,
    },
    JobResponse(JobResponse),
    CancelSibling {
        session_id: SessionId,
        job_id: JobId,
    },
    SiblingsRequest {
        session_id: SessionId,
    },
    Siblings {
        siblings: Vec<SiblingRecord>,
    },
    SetAttribute {
        session_id: SessionId,
        key: String,
        value: Value,
    },
    GetAttribute {
        session_id: SessionId,
        key: String,
    },
    Attribute {
        value: Option<Value>,
    },
    Checkpoint(CheckpointRequest),
    ServiceInvoke {
        name: String,
        method: String,
        args: Value,
    },
    /// `Err` carries the message of an error raised by the service method itself.
    ServiceInvokeResponse {
        result: Result<Value, String>,
    },
    Deploy(ServiceDescriptor),
    Undeploy {
        name: String,
    },
    ApplyAssignment(AssignmentTable),
    /// Asks a node for its replica of the assignment table.
    AssignmentRequest,
    Ack,
    Failure(FabricError),
}

impl Envelope {
    pub fn topic(&self) -> Topic {
        match self {
            Envelope::ExecuteJob(_) | Envelope::CancelJob { .. } => Topic::Job,
            Envelope::JobResponse(_)
            | Envelope::CancelSibling { .. }
            | Envelope::SiblingsRequest { .. }
            | Envelope::SetAttribute { .. }
            | Envelope::GetAttribute { .. } => Topic::Task,
            Envelope::Checkpoint(_) => Topic::Checkpoint,
            Envelope::ServiceInvoke { .. } => Topic::Service,
            Envelope::Deploy(_)
            | Envelope::Undeploy { .. }
            | Envelope::ApplyAssignment(_)
            | Envelope::AssignmentRequest => Topic::Deployment,
            Envelope::Siblings { .. }
            | Envelope::Attribute { .. }
            | Envelope::ServiceInvokeResponse { .. }
            | Envelope::Ack
            | Envelope::Failure(_) => Topic::Reply,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ExecuteJob(_) => "ExecuteJob",
            Envelope::CancelJob { .. } => "CancelJob",
            Envelope::JobResponse(_) => "JobResponse",
            Envelope::CancelSibling { .. } => "CancelSibling",
            Envelope::SiblingsRequest { .. } => "SiblingsRequest",
            Envelope::Siblings { .. } => "Siblings",
            Envelope::SetAttribute { .. } => "SetAttribute",
            Envelope::GetAttribute { .. } => "GetAttribute",
            Envelope::Attribute { .. } => "Attribute",
            Envelope::Checkpoint(_) => "Checkpoint",
            Envelope::ServiceInvoke { .. } => "ServiceInvoke",
            Envelope::ServiceInvokeResponse { .. } => "ServiceInvokeResponse",
            Envelope::Deploy(_) => "Deploy",
            Envelope::Undeploy { .. } => "Undeploy",
            Envelope::ApplyAssignment(_) => "ApplyAssignment",
            Envelope::AssignmentRequest => "AssignmentRequest",
            Envelope::Ack => "Ack",
            Envelope::Failure(_) => "Failure",
        }
    }
}
