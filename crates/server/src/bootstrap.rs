use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use triage_agent::scoring::{HttpScoringClient, KeywordScoringClient, ScoringClient, ScoringError};
use triage_agent::transport::{Transport, TransportError};
use triage_core::config::{AppConfig, ConfigError, LoadOptions};
use triage_db::{migrations, open_checkpoint_pool, DbPool, SqlCheckpointStore};

use crate::orchestrator::Orchestrator;
use crate::transport::HttpTransport;
use crate::webhook::VerificationPolicy;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
    pub verification: Arc<VerificationPolicy>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("scoring client construction failed: {0}")]
    Scoring(#[source] ScoringError),
    #[error("transport client construction failed: {0}")]
    Transport(#[source] TransportError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = open_checkpoint_pool(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "checkpoint store connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let scoring: Arc<dyn ScoringClient> = match &config.scoring.endpoint {
        Some(endpoint) => Arc::new(
            HttpScoringClient::new(
                endpoint.clone(),
                config.scoring.api_key.clone(),
                config.scoring.model.clone(),
                Duration::from_secs(config.scoring.timeout_secs.max(1)),
            )
            .map_err(BootstrapError::Scoring)?,
        ),
        None => Arc::new(KeywordScoringClient::new()),
    };
    info!(
        event_name = "system.bootstrap.scoring_mode",
        correlation_id = "bootstrap",
        mode = if config.scoring.endpoint.is_some() { "http" } else { "keyword" },
        "scoring collaborator initialized"
    );

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::from_config(&config.transport).map_err(BootstrapError::Transport)?);

    let policy = config.routing.policy()?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(SqlCheckpointStore::new(db_pool.clone())),
        scoring,
        transport,
        policy,
        Duration::from_millis(config.transport.send_delay_ms),
        config.scoring.max_retries,
    ));

    let verification = Arc::new(VerificationPolicy {
        secret: config.webhook.secret.clone(),
        replay_window_secs: config.webhook.replay_window_secs,
    });

    Ok(Application { config, db_pool, orchestrator, verification })
}

#[cfg(test)]
mod tests {
    use triage_core::config::{ConfigOverrides, LoadOptions};

    use super::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_when_signatures_are_required_without_a_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                require_signature: Some(true),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("webhook.secret"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_exposes_the_checkpoint_schema() {
        let app = bootstrap(overrides("sqlite:file:bootstrap_schema?mode=memory&cache=shared"))
            .await
            .expect("bootstrap should succeed with defaults");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('checkpoint', 'checkpoint_history')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected checkpoint tables to be available after bootstrap");
        assert_eq!(table_count, 2);

        assert!(app.verification.secret.is_none());
        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_carries_the_webhook_secret_into_the_verification_policy() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(
                    "sqlite:file:bootstrap_secret?mode=memory&cache=shared".to_string(),
                ),
                webhook_secret: Some("wh-secret".to_string()),
                replay_window_secs: Some(120),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap");

        assert!(app.verification.secret.is_some());
        assert_eq!(app.verification.replay_window_secs, 120);
        app.db_pool.close().await;
    }
}
