use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use triage_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// Open the checkpoint pool described by `config`.
///
/// WAL lets the health probe and `list` read while an event checkpoints;
/// the busy timeout rides out write contention when same-key events land on
/// different pool connections.
pub async fn open_checkpoint_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    open_pool(&config.url, config.max_connections, config.timeout_secs, config.busy_timeout_ms)
        .await
}

/// Lower-level variant for throwaway pools in tests.
pub async fn open_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout_secs: u64,
    busy_timeout_ms: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs.max(1)))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}
