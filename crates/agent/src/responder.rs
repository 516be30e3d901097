//! Idempotent outbound delivery.
//!
//! Drains not-yet-sent generated messages through the transport, marking
//! each one `sent` in state the moment the transport acknowledges it. A
//! crash between a send and the next checkpoint write means the message is
//! re-attempted, never re-observed as a duplicate by the orchestrator:
//! at-most-once-effective from our side, at-least-once-attempted worst case.

use std::time::Duration;

use tracing::{info, warn};

use triage_core::{ConversationState, Message, Role};

use crate::transport::Transport;

/// Bounded recent window: after a long outage we do not replay a stale
/// backlog of unsent candidates.
pub const MAX_OUTBOUND_WINDOW: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    PartialFailure,
    NoNewMessages,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResult {
    pub sent_count: usize,
    pub failed: Vec<Message>,
    pub status: DeliveryStatus,
}

pub struct Responder {
    pacing: Duration,
}

impl Responder {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing }
    }

    /// Send every unsent generated message in the recent window, pacing
    /// sequential sends. One failed send does not block the rest.
    pub async fn deliver(
        &self,
        state: &mut ConversationState,
        transport: &dyn Transport,
    ) -> DeliveryResult {
        let candidates: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.role == Role::Generated && !message.sent)
            .map(|(index, _)| index)
            .collect();
        let window_start = candidates.len().saturating_sub(MAX_OUTBOUND_WINDOW);
        let selected = &candidates[window_start..];

        if selected.is_empty() {
            return DeliveryResult {
                sent_count: 0,
                failed: Vec::new(),
                status: DeliveryStatus::NoNewMessages,
            };
        }

        let recipient = state.contact_id.clone();
        let mut sent_count = 0;
        let mut failed = Vec::new();
        for (position, index) in selected.iter().enumerate() {
            if position > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let content = state.messages[*index].content.clone();
            match transport.send(&recipient, &content).await {
                Ok(()) => {
                    // Marked before the next checkpoint write; the flag is
                    // what makes re-invocation after a crash safe.
                    state.messages[*index].sent = true;
                    sent_count += 1;
                    info!(
                        event_name = "responder.message_sent",
                        thread_key = %state.thread_key,
                        "outbound message delivered"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "responder.send_failed",
                        thread_key = %state.thread_key,
                        error = %error,
                        "outbound send failed, continuing with remainder"
                    );
                    failed.push(state.messages[*index].clone());
                }
            }
        }

        let status = if failed.is_empty() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::PartialFailure
        };
        DeliveryResult { sent_count, failed, status }
    }
}
