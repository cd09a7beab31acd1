use crate::compute::types::SessionId;
use crate::error::{FabricError, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointScope {
    /// Lives until the saving job finishes.
    Job,
    /// Lives until the owning task session ends.
    Task,
}

/// Registration of a task-scoped checkpoint with the task's origin node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub session_id: SessionId,
    pub key: String,
    /// Store selector; `None` means the default store.
    pub store: Option<String>,
}

impl CheckpointRequest {
    /// Builds a request, rejecting an empty key. An empty store name is normalised
    /// to `None`.
    pub fn new(session_id: SessionId, key: impl Into<String>, store: Option<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(FabricError::InvalidArgument(
                "checkpoint key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            session_id,
            key,
            store: store.filter(|name| !name.is_empty()),
        })
    }
}
