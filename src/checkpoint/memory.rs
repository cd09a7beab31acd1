use super::store::CheckpointStore;
use super::types::CheckpointScope;
use crate::compute::types::SessionId;

use async_trait::async_trait;
use dashmap::DashMap;

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: DashMap<(SessionId, String), (Vec<u8>, CheckpointScope)>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn scope_of(&self, session_id: &SessionId, key: &str) -> Option<CheckpointScope> {
        self.entries
            .get(&(session_id.clone(), key.to_string()))
            .map(|entry| entry.value().1)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(
        &self,
        session_id: &SessionId,
        key: &str,
        blob: Vec<u8>,
        scope: CheckpointScope,
    ) -> anyhow::Result<()> {
        tracing::trace!("Saving checkpoint {}/{} ({} bytes)", session_id, key, blob.len());
        self.entries
            .insert((session_id.clone(), key.to_string()), (blob, scope));
        Ok(())
    }

    async fn load(&self, session_id: &SessionId, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(session_id.clone(), key.to_string()))
            .map(|entry| entry.value().0.clone()))
    }

    async fn remove(&self, session_id: &SessionId, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .entries
            .remove(&(session_id.clone(), key.to_string()))
            .is_some())
    }
}
