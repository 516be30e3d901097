use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::router::{RoutingPolicy, ScoreBands, DEFAULT_MAX_ESCALATIONS};
use crate::signature::DEFAULT_MAX_AGE_SECS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub transport: TransportConfig,
    pub scoring: ScoringConfig,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    /// How long a connection waits on a locked checkpoint row before giving
    /// up; same-key events contend when they land on different connections.
    pub busy_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// When absent, unsigned traffic is accepted (explicit opt-out for
    /// environments without a shared secret).
    pub secret: Option<SecretString>,
    /// Policy switch: signed traffic is mandated. A missing secret then
    /// fails validation instead of silently accepting unverifiable traffic.
    pub require_signature: bool,
    pub replay_window_secs: i64,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub endpoint: String,
    pub api_token: Option<SecretString>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Pacing between sequential sends; a rate-limit courtesy, not a
    /// correctness requirement.
    pub send_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ScoringConfig {
    /// When absent, the deterministic keyword scorer runs in-process.
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub low_max: u8,
    pub mid_max: u8,
    pub max_escalations: u32,
}

impl RoutingConfig {
    pub fn policy(&self) -> Result<RoutingPolicy, ConfigError> {
        let bands = ScoreBands::new(self.low_max, self.mid_max)
            .map_err(|error| ConfigError::Validation(error.to_string()))?;
        Ok(RoutingPolicy { bands, max_escalations: self.max_escalations })
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub webhook_secret: Option<String>,
    pub require_signature: Option<bool>,
    pub replay_window_secs: Option<i64>,
    pub transport_endpoint: Option<String>,
    pub transport_api_token: Option<String>,
    pub scoring_endpoint: Option<String>,
    pub max_escalations: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://triage.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                busy_timeout_ms: 5_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            webhook: WebhookConfig {
                secret: None,
                require_signature: false,
                replay_window_secs: DEFAULT_MAX_AGE_SECS,
            },
            transport: TransportConfig {
                endpoint: "https://services.leadconnectorhq.com".to_string(),
                api_token: None,
                timeout_secs: 15,
                max_retries: 2,
                send_delay_ms: 1500,
            },
            scoring: ScoringConfig {
                endpoint: None,
                api_key: None,
                model: "qualifier-v1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            routing: RoutingConfig {
                low_max: 4,
                mid_max: 7,
                max_escalations: DEFAULT_MAX_ESCALATIONS,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("triage.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
            if let Some(busy_timeout_ms) = database.busy_timeout_ms {
                self.database.busy_timeout_ms = busy_timeout_ms;
            }
        }
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }
        if let Some(webhook) = patch.webhook {
            if let Some(secret) = webhook.secret {
                self.webhook.secret = Some(secret.into());
            }
            if let Some(require_signature) = webhook.require_signature {
                self.webhook.require_signature = require_signature;
            }
            if let Some(replay_window_secs) = webhook.replay_window_secs {
                self.webhook.replay_window_secs = replay_window_secs;
            }
        }
        if let Some(transport) = patch.transport {
            if let Some(endpoint) = transport.endpoint {
                self.transport.endpoint = endpoint;
            }
            if let Some(api_token) = transport.api_token {
                self.transport.api_token = Some(api_token.into());
            }
            if let Some(timeout_secs) = transport.timeout_secs {
                self.transport.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = transport.max_retries {
                self.transport.max_retries = max_retries;
            }
            if let Some(send_delay_ms) = transport.send_delay_ms {
                self.transport.send_delay_ms = send_delay_ms;
            }
        }
        if let Some(scoring) = patch.scoring {
            if let Some(endpoint) = scoring.endpoint {
                self.scoring.endpoint = Some(endpoint);
            }
            if let Some(api_key) = scoring.api_key {
                self.scoring.api_key = Some(api_key.into());
            }
            if let Some(model) = scoring.model {
                self.scoring.model = model;
            }
            if let Some(timeout_secs) = scoring.timeout_secs {
                self.scoring.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = scoring.max_retries {
                self.scoring.max_retries = max_retries;
            }
        }
        if let Some(routing) = patch.routing {
            if let Some(low_max) = routing.low_max {
                self.routing.low_max = low_max;
            }
            if let Some(mid_max) = routing.mid_max {
                self.routing.mid_max = mid_max;
            }
            if let Some(max_escalations) = routing.max_escalations {
                self.routing.max_escalations = max_escalations;
            }
        }
        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format.parse()?;
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("TRIAGE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("TRIAGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("TRIAGE_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Ok(secret) = env::var("TRIAGE_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret.into());
        }
        if let Ok(value) = env::var("TRIAGE_REQUIRE_SIGNATURE") {
            self.webhook.require_signature = parse_bool("TRIAGE_REQUIRE_SIGNATURE", &value)?;
        }
        if let Ok(value) = env::var("TRIAGE_REPLAY_WINDOW_SECS") {
            self.webhook.replay_window_secs = value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "TRIAGE_REPLAY_WINDOW_SECS".to_string(),
                    value,
                }
            })?;
        }
        if let Ok(endpoint) = env::var("TRIAGE_TRANSPORT_ENDPOINT") {
            self.transport.endpoint = endpoint;
        }
        if let Ok(token) = env::var("TRIAGE_TRANSPORT_TOKEN") {
            self.transport.api_token = Some(token.into());
        }
        if let Ok(endpoint) = env::var("TRIAGE_SCORING_ENDPOINT") {
            self.scoring.endpoint = Some(endpoint);
        }
        if let Ok(key) = env::var("TRIAGE_SCORING_API_KEY") {
            self.scoring.api_key = Some(key.into());
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(secret) = overrides.webhook_secret {
            self.webhook.secret = Some(secret.into());
        }
        if let Some(require_signature) = overrides.require_signature {
            self.webhook.require_signature = require_signature;
        }
        if let Some(replay_window_secs) = overrides.replay_window_secs {
            self.webhook.replay_window_secs = replay_window_secs;
        }
        if let Some(endpoint) = overrides.transport_endpoint {
            self.transport.endpoint = endpoint;
        }
        if let Some(token) = overrides.transport_api_token {
            self.transport.api_token = Some(token.into());
        }
        if let Some(endpoint) = overrides.scoring_endpoint {
            self.scoring.endpoint = Some(endpoint);
        }
        if let Some(max_escalations) = overrides.max_escalations {
            self.routing.max_escalations = max_escalations;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.bind_address must not be empty".to_string(),
            ));
        }
        if self.webhook.require_signature && self.webhook.secret.is_none() {
            return Err(ConfigError::Validation(
                "webhook.require_signature is set but webhook.secret is absent; \
                 refusing to accept unverifiable traffic"
                    .to_string(),
            ));
        }
        if self.webhook.replay_window_secs <= 0 {
            return Err(ConfigError::Validation(
                "webhook.replay_window_secs must be positive".to_string(),
            ));
        }
        if self.transport.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation(
                "transport.endpoint must not be empty".to_string(),
            ));
        }
        self.routing.policy().map(|_| ())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("triage.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    webhook: Option<WebhookPatch>,
    transport: Option<TransportPatch>,
    scoring: Option<ScoringPatch>,
    routing: Option<RoutingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WebhookPatch {
    secret: Option<String>,
    require_signature: Option<bool>,
    replay_window_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TransportPatch {
    endpoint: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    send_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ScoringPatch {
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RoutingPatch {
    low_max: Option<u8>,
    mid_max: Option<u8>,
    max_escalations: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    fn load_file(contents: &str) -> Result<AppConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            ..LoadOptions::default()
        })
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::load(LoadOptions::default()).expect("defaults load");
        assert_eq!(config.routing.low_max, 4);
        assert_eq!(config.routing.mid_max, 7);
        assert_eq!(config.webhook.replay_window_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn toml_patch_overrides_defaults() {
        let config = load_file(
            r#"
            [database]
            url = "sqlite::memory:"
            busy_timeout_ms = 250

            [webhook]
            secret = "wh-secret"
            replay_window_secs = 120

            [routing]
            low_max = 3
            mid_max = 6

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .expect("load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.busy_timeout_ms, 250);
        assert_eq!(config.webhook.replay_window_secs, 120);
        assert_eq!(
            config.webhook.secret.as_ref().map(|s| s.expose_secret().to_string()),
            Some("wh-secret".to_string())
        );
        assert_eq!(config.routing.low_max, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn require_signature_without_secret_fails_validation() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                require_signature: Some(true),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        let message = result.err().expect("validation error").to_string();
        assert!(message.contains("webhook.secret"));
    }

    #[test]
    fn invalid_log_format_in_the_file_is_rejected() {
        let result = load_file(
            r#"
            [logging]
            format = "verbose"
            "#,
        );
        let message = result.err().expect("parse error").to_string();
        assert!(message.contains("unsupported log format"));
    }

    #[test]
    fn invalid_bands_fail_validation() {
        let result = load_file(
            r#"
            [routing]
            low_max = 8
            mid_max = 5
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn programmatic_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"[database]\nurl = \"sqlite://file.db\"\n").expect("write");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                webhook_secret: Some("override-secret".to_string()),
                ..ConfigOverrides::default()
            },
        })
        .expect("load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert!(config.webhook.secret.is_some());
    }

    #[test]
    fn zero_replay_window_is_rejected() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                replay_window_secs: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
