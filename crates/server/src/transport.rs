//! Outbound messaging transport over HTTP.
//!
//! Implements the engine's `Transport` contract against the hosted
//! messaging API. Retries are bounded here, per send; the responder's
//! partial-failure handling sits above.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::warn;

use triage_agent::{Transport, TransportError};
use triage_core::config::TransportConfig;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_token: Option<SecretString>,
    max_retries: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    contact_id: &'a str,
    message: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
}

impl HttpTransport {
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| TransportError::Unreachable(error.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_once(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
        let url = format!("{}/conversations/messages", self.endpoint);
        let request = SendMessageRequest {
            contact_id: recipient,
            message: text,
            message_type: "SMS",
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransportError::Unreachable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Rejected {
                recipient: recipient.to_string(),
                reason: format!("messaging API returned {}", response.status()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            match self.send_once(recipient, text).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "transport.retry",
                        attempt,
                        error = %error,
                        "transport send failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
