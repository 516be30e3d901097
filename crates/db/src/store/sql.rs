use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use triage_core::{ConversationState, ThreadKey};

use super::{Checkpoint, CheckpointStore, StoreError};
use crate::DbPool;

pub struct SqlCheckpointStore {
    pool: DbPool,
}

impl SqlCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn get(&self, thread_key: &ThreadKey) -> Result<Option<ConversationState>, StoreError> {
        let row = sqlx::query("SELECT state_json FROM checkpoint WHERE thread_key = ?")
            .bind(thread_key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode_state(&row.get::<String, _>("state_json"))).transpose()
    }

    async fn put(
        &self,
        thread_key: &ThreadKey,
        state: &ConversationState,
    ) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)
            .map_err(|error| StoreError::Encode(error.to_string()))?;
        let updated_at = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        // Last-write-wins upsert; the version bump gives `list` a stable
        // ordering even when updates land within the same millisecond.
        sqlx::query(
            "INSERT INTO checkpoint (thread_key, state_json, version, updated_at)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(thread_key) DO UPDATE SET
                state_json = excluded.state_json,
                version = checkpoint.version + 1,
                updated_at = excluded.updated_at",
        )
        .bind(thread_key.as_str())
        .bind(&state_json)
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO checkpoint_history (thread_key, state_json, version, updated_at)
             SELECT thread_key, state_json, version, updated_at
             FROM checkpoint WHERE thread_key = ?",
        )
        .bind(thread_key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list(
        &self,
        thread_key: &ThreadKey,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT thread_key, state_json, version, updated_at
             FROM checkpoint_history
             WHERE thread_key = ?
             ORDER BY version DESC
             LIMIT ?",
        )
        .bind(thread_key.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(checkpoint_from_row).collect()
    }
}

fn checkpoint_from_row(row: SqliteRow) -> Result<Checkpoint, StoreError> {
    let updated_at_raw: String = row.get("updated_at");
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_raw)
        .map_err(|error| StoreError::Decode(format!("bad updated_at timestamp: {error}")))?
        .with_timezone(&Utc);

    Ok(Checkpoint {
        thread_key: ThreadKey(row.get("thread_key")),
        state: decode_state(&row.get::<String, _>("state_json"))?,
        version: row.get("version"),
        updated_at,
    })
}

fn decode_state(state_json: &str) -> Result<ConversationState, StoreError> {
    serde_json::from_str(state_json).map_err(|error| StoreError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use triage_core::{ConversationState, Message, ThreadKey};

    use super::SqlCheckpointStore;
    use crate::store::CheckpointStore;
    use crate::{migrations, open_pool};

    // Named in-memory databases keep concurrently running tests isolated.
    async fn store(db_name: &str) -> SqlCheckpointStore {
        let url = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
        let pool = open_pool(&url, 1, 5, 5_000).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations apply");
        SqlCheckpointStore::new(pool)
    }

    fn sample_state(key: &ThreadKey) -> ConversationState {
        let mut state = ConversationState::new(key.clone(), "c-9");
        state.merge_messages(vec![Message::human("Hello")]);
        state
    }

    #[tokio::test]
    async fn get_returns_absent_for_unknown_key() {
        let store = store("store_absent").await;
        let key = ThreadKey::derive(None, "nobody");
        assert!(store.get(&key).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_state() {
        let store = store("store_round_trip").await;
        let key = ThreadKey::derive(Some("abc"), "c-9");
        let state = sample_state(&key);

        store.put(&key, &state).await.expect("put");
        let loaded = store.get(&key).await.expect("get").expect("present");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn redundant_put_with_unchanged_state_is_harmless() {
        let store = store("store_redundant_put").await;
        let key = ThreadKey::derive(Some("abc"), "c-9");
        let state = sample_state(&key);

        store.put(&key, &state).await.expect("first put");
        store.put(&key, &state).await.expect("second put");

        let loaded = store.get(&key).await.expect("get").expect("present");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn last_write_wins_and_history_is_ordered_newest_first() {
        let store = store("store_history").await;
        let key = ThreadKey::derive(Some("abc"), "c-9");
        let mut state = sample_state(&key);

        store.put(&key, &state).await.expect("put v1");
        state.absorb_score(6);
        store.put(&key, &state).await.expect("put v2");

        let loaded = store.get(&key).await.expect("get").expect("present");
        assert_eq!(loaded.qualification_score, 6);

        let history = store.list(&key, 10).await.expect("list");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 2);
        assert_eq!(history[1].version, 1);
        assert_eq!(history[0].state.qualification_score, 6);
    }

    #[tokio::test]
    async fn list_honors_the_limit() {
        let store = store("store_limit").await;
        let key = ThreadKey::derive(Some("abc"), "c-9");
        let state = sample_state(&key);

        for _ in 0..5 {
            store.put(&key, &state).await.expect("put");
        }

        let history = store.list(&key, 3).await.expect("list");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].version, 5);
    }
}
