use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use triage_core::{ConversationState, ThreadKey};

use super::{Checkpoint, CheckpointStore, StoreError};

/// In-memory store for tests and the degraded single-event fallback path.
/// Same last-write-wins and history semantics as the SQL store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    history: RwLock<HashMap<ThreadKey, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn checkpoint_count(&self, thread_key: &ThreadKey) -> usize {
        self.history.read().await.get(thread_key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_key: &ThreadKey) -> Result<Option<ConversationState>, StoreError> {
        let history = self.history.read().await;
        Ok(history.get(thread_key).and_then(|versions| versions.last()).map(|cp| cp.state.clone()))
    }

    async fn put(
        &self,
        thread_key: &ThreadKey,
        state: &ConversationState,
    ) -> Result<(), StoreError> {
        let mut history = self.history.write().await;
        let versions = history.entry(thread_key.clone()).or_default();
        let version = versions.last().map_or(1, |cp| cp.version + 1);
        versions.push(Checkpoint {
            thread_key: thread_key.clone(),
            state: state.clone(),
            version,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(
        &self,
        thread_key: &ThreadKey,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let history = self.history.read().await;
        Ok(history
            .get(thread_key)
            .map(|versions| versions.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}
