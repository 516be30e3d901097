//! Webhook ingress boundary.
//!
//! Verification and validation happen synchronously; orchestration runs as a
//! background task so the platform gets its acceptance response immediately.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use triage_core::signature;
use triage_core::ThreadKey;

use crate::orchestrator::{InboundEvent, Orchestrator};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone)]
pub struct WebhookState {
    pub policy: Arc<VerificationPolicy>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Signature policy resolved at bootstrap. `require_signature` without a
/// secret is rejected during config validation, so `secret: None` here
/// always means the explicit unsigned opt-out.
pub struct VerificationPolicy {
    pub secret: Option<SecretString>,
    pub replay_window_secs: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    contact_id: Option<String>,
    conversation_id: Option<String>,
    message: Option<WebhookMessage>,
    #[allow(dead_code)]
    location_id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    body: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookAccepted {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookRejected {
    pub error: String,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/webhook", post(receive_webhook)).with_state(state)
}

async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookAccepted>), (StatusCode, Json<WebhookRejected>)> {
    let correlation_id = Uuid::new_v4().to_string();

    verify_request(&state.policy, &headers, &body, &correlation_id)?;

    let payload: WebhookPayload = serde_json::from_str(&body).map_err(|error| {
        warn!(
            event_name = "webhook.malformed_body",
            correlation_id,
            error = %error,
            "webhook body could not be decoded"
        );
        rejected(StatusCode::BAD_REQUEST, "malformed webhook body")
    })?;

    if !is_inbound_message(payload.event_type.as_deref()) {
        info!(
            event_name = "webhook.event_ignored",
            correlation_id,
            event_type = payload.event_type.as_deref().unwrap_or("missing"),
            "non-inbound event accepted without orchestration"
        );
        return Ok((StatusCode::OK, Json(WebhookAccepted { status: "accepted", thread_key: None })));
    }

    let contact_id = payload
        .contact_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| rejected(StatusCode::BAD_REQUEST, "missing contact id"))?
        .to_string();
    let text = payload
        .message
        .as_ref()
        .and_then(|message| message.body.as_deref())
        .map(str::trim)
        .filter(|body| !body.is_empty())
        .ok_or_else(|| rejected(StatusCode::BAD_REQUEST, "empty message body"))?
        .to_string();

    let thread_key = ThreadKey::derive(payload.conversation_id.as_deref(), &contact_id);
    let event = InboundEvent { thread_key: thread_key.clone(), contact_id, text };

    info!(
        event_name = "webhook.event_accepted",
        correlation_id,
        thread_key = %thread_key,
        "inbound event accepted, orchestration scheduled"
    );

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(orchestrate_error) = orchestrator.process_event(event, &correlation_id).await {
            error!(
                event_name = "webhook.orchestration_failed",
                correlation_id,
                error = %orchestrate_error,
                "background orchestration did not complete"
            );
        }
    });

    Ok((
        StatusCode::OK,
        Json(WebhookAccepted { status: "accepted", thread_key: Some(thread_key.0) }),
    ))
}

fn verify_request(
    policy: &VerificationPolicy,
    headers: &HeaderMap,
    body: &str,
    correlation_id: &str,
) -> Result<(), (StatusCode, Json<WebhookRejected>)> {
    let Some(secret) = &policy.secret else {
        // Explicit opt-out: no secret configured, unsigned traffic accepted.
        return Ok(());
    };

    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| invalid_signature(correlation_id, "missing signature header"))?;

    match signature::verify(
        body.as_bytes(),
        header,
        secret.expose_secret(),
        policy.replay_window_secs,
    ) {
        Ok(true) => Ok(()),
        Ok(false) => Err(invalid_signature(correlation_id, "signature mismatch or stale")),
        Err(parse_error) => {
            Err(invalid_signature(correlation_id, &parse_error.to_string()))
        }
    }
}

fn invalid_signature(
    correlation_id: &str,
    detail: &str,
) -> (StatusCode, Json<WebhookRejected>) {
    warn!(
        event_name = "webhook.signature_rejected",
        correlation_id,
        detail,
        "webhook signature verification failed"
    );
    (StatusCode::UNAUTHORIZED, Json(WebhookRejected { error: "INVALID_SIGNATURE".to_string() }))
}

fn rejected(status: StatusCode, message: &str) -> (StatusCode, Json<WebhookRejected>) {
    (status, Json(WebhookRejected { error: message.to_string() }))
}

fn is_inbound_message(event_type: Option<&str>) -> bool {
    event_type.is_some_and(|value| value.eq_ignore_ascii_case("InboundMessage"))
}
