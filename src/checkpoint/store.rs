use super::memory::InMemoryCheckpointStore;
use super::types::CheckpointScope;
use crate::compute::types::SessionId;
use crate::error::{FabricError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Persistent checkpoint storage keyed by (session, key).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(
        &self,
        session_id: &SessionId,
        key: &str,
        blob: Vec<u8>,
        scope: CheckpointScope,
    ) -> anyhow::Result<()>;

    async fn load(&self, session_id: &SessionId, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Returns whether something was removed.
    async fn remove(&self, session_id: &SessionId, key: &str) -> anyhow::Result<bool>;
}

/// Named checkpoint stores available on a node.
pub struct CheckpointStores {
    default_name: String,
    stores: DashMap<String, Arc<dyn CheckpointStore>>,
}

impl CheckpointStores {
    /// A registry holding one in-memory store under `default_name`.
    pub fn new(default_name: impl Into<String>) -> Arc<Self> {
        let registry = Self::empty(default_name);
        registry.register(
            registry.default_name.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
        );
        Arc::new(registry)
    }

    pub fn empty(default_name: impl Into<String>) -> Self {
        Self {
            default_name: default_name.into(),
            stores: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>, store: Arc<dyn CheckpointStore>) {
        let name = name.into();
        tracing::info!("Registered checkpoint store: {}", name);
        self.stores.insert(name, store);
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Looks up a store; `None` or an empty name selects the default.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn CheckpointStore>> {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => self.default_name.as_str(),
        };

        self.stores
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FabricError::InvalidArgument(format!("unknown checkpoint store '{}'", name)))
    }
}
