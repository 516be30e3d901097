pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::{open_checkpoint_pool, open_pool, DbPool};
pub use store::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SqlCheckpointStore, StoreError};
