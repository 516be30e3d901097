use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use triage_core::{ConversationState, ThreadKey};

pub mod memory;
pub mod sql;

pub use memory::InMemoryCheckpointStore;
pub use sql::SqlCheckpointStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// A durable snapshot of one conversation's state at a logical version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub thread_key: ThreadKey,
    pub state: ConversationState,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Durable key-value abstraction over conversation state.
///
/// `put` is last-write-wins per thread key and safe to call redundantly with
/// an unchanged state. `list` returns recent snapshots, newest first, for
/// inspection and audit.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_key: &ThreadKey) -> Result<Option<ConversationState>, StoreError>;
    async fn put(&self, thread_key: &ThreadKey, state: &ConversationState)
        -> Result<(), StoreError>;
    async fn list(&self, thread_key: &ThreadKey, limit: u32)
        -> Result<Vec<Checkpoint>, StoreError>;
}
