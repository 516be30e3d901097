//! Per-event conversation control loop.
//!
//! One inbound event flows: load/create state, append inbound (deduplicated),
//! score, route, respond, deliver, checkpoint. Events for the same thread key
//! are serialized through a keyed lease; different keys run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use triage_agent::handlers::{HandlerOutcome, HandlerRegistry};
use triage_agent::responder::Responder;
use triage_agent::scoring::{score_with_retries, ScoringClient};
use triage_agent::transport::Transport;
use triage_core::domain::conversation::Stage;
use triage_core::router::{route, Routing, RoutingPolicy};
use triage_core::{ConversationState, HandlerKind, Message, Role, ThreadKey};
use triage_db::CheckpointStore;

const SCORING_BACKOFF: Duration = Duration::from_millis(400);

/// Sent when no handler-produced reply exists after the router terminated
/// the conversation. Customers never see raw errors.
const FALLBACK_REPLY: &str =
    "Thanks for your patience - I'm looping in a teammate who can help you \
     directly. Someone will follow up with you shortly.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub thread_key: ThreadKey,
    pub contact_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSummary {
    pub thread_key: ThreadKey,
    pub stage: Stage,
    pub score: u8,
    pub handler: Option<HandlerKind>,
    pub appended: usize,
    pub sent_count: usize,
    pub persisted: bool,
}

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("per-key lease expired after {0:?} while processing the event")]
    LeaseExpired(Duration),
}

pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    scoring: Arc<dyn ScoringClient>,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    policy: RoutingPolicy,
    responder: Responder,
    scoring_retries: u32,
    lease_timeout: Duration,
    locks: KeyedLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        scoring: Arc<dyn ScoringClient>,
        transport: Arc<dyn Transport>,
        policy: RoutingPolicy,
        pacing: Duration,
        scoring_retries: u32,
    ) -> Self {
        Self {
            store,
            scoring,
            transport,
            handlers: HandlerRegistry::new(),
            policy,
            responder: Responder::new(pacing),
            scoring_retries,
            lease_timeout: Duration::from_secs(30),
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Process one inbound event end to end. Holds the per-key lease for the
    /// duration; the lease itself expires so a wedged event cannot stall a
    /// conversation forever.
    pub async fn process_event(
        &self,
        event: InboundEvent,
        correlation_id: &str,
    ) -> Result<EventSummary, OrchestrateError> {
        let lease = self.locks.handle(event.thread_key.as_str());
        let guard = lease.lock().await;

        let result =
            tokio::time::timeout(self.lease_timeout, self.run_event(event, correlation_id)).await;
        drop(guard);

        result.map_err(|_| OrchestrateError::LeaseExpired(self.lease_timeout))
    }

    async fn run_event(&self, event: InboundEvent, correlation_id: &str) -> EventSummary {
        let mut persisted = true;
        let mut state = match self.store.get(&event.thread_key).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!(
                    event_name = "orchestrator.conversation_created",
                    correlation_id,
                    thread_key = %event.thread_key,
                    "first inbound event for thread key"
                );
                ConversationState::new(event.thread_key.clone(), event.contact_id.clone())
            }
            Err(error) => {
                // Availability over durability: process this one event in
                // memory, flag it, and skip the checkpoint write.
                warn!(
                    event_name = "orchestrator.store_degraded",
                    correlation_id,
                    thread_key = %event.thread_key,
                    error = %error,
                    "checkpoint store unavailable, processing event in memory"
                );
                persisted = false;
                let mut state =
                    ConversationState::new(event.thread_key.clone(), event.contact_id.clone());
                state.record_error(format!("checkpoint store unavailable: {error}"));
                state
            }
        };

        let appended = state.merge_messages(vec![Message::human(event.text)]);
        if appended == 0 {
            info!(
                event_name = "orchestrator.duplicate_inbound",
                correlation_id,
                thread_key = %state.thread_key,
                "inbound message already present, no net new content"
            );
        }

        self.apply_scoring(&mut state, correlation_id).await;

        if state.stage == Stage::New {
            state.stage = Stage::Qualifying;
        }

        let outbound = self.route_and_respond(&mut state, correlation_id);
        state.merge_messages(outbound);

        let delivery = self.responder.deliver(&mut state, self.transport.as_ref()).await;
        if !delivery.failed.is_empty() {
            state.record_error(format!("{} outbound send(s) failed", delivery.failed.len()));
        }
        // Whatever is still unsent remains a pending candidate for the next
        // event's drain.
        state.pending_outbound = state
            .messages
            .iter()
            .filter(|message| message.role == Role::Generated && !message.sent)
            .cloned()
            .collect();

        if persisted {
            if let Err(error) = self.store.put(&state.thread_key, &state).await {
                warn!(
                    event_name = "orchestrator.checkpoint_write_failed",
                    correlation_id,
                    thread_key = %state.thread_key,
                    error = %error,
                    "event processed but checkpoint write failed"
                );
                persisted = false;
            }
        }

        info!(
            event_name = "orchestrator.event_processed",
            correlation_id,
            thread_key = %state.thread_key,
            stage = ?state.stage,
            score = state.qualification_score,
            sent_count = delivery.sent_count,
            persisted,
            "inbound event processed"
        );

        EventSummary {
            thread_key: state.thread_key.clone(),
            stage: state.stage,
            score: state.qualification_score,
            handler: state.current_handler,
            appended,
            sent_count: delivery.sent_count,
            persisted,
        }
    }

    async fn apply_scoring(&self, state: &mut ConversationState, correlation_id: &str) {
        match score_with_retries(
            self.scoring.as_ref(),
            state,
            self.scoring_retries,
            SCORING_BACKOFF,
        )
        .await
        {
            Ok(outcome) => {
                state.absorb_score(outcome.score);
                state.merge_fields(outcome.fields);
            }
            Err(error) => {
                // Keep the prior score; monotonicity must not regress on a
                // collaborator outage.
                warn!(
                    event_name = "orchestrator.scoring_unavailable",
                    correlation_id,
                    thread_key = %state.thread_key,
                    error = %error,
                    "scoring exhausted retries, keeping prior score"
                );
                state.record_error(format!("scoring unavailable: {error}"));
            }
        }
    }

    /// Run the router/handler loop for this event. Escalations re-enter the
    /// router; the escalation bound guarantees termination.
    fn route_and_respond(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
    ) -> Vec<Message> {
        loop {
            match route(state, &self.policy) {
                Routing::AlreadyTerminal => return Vec::new(),
                Routing::Terminate => {
                    state.stage = Stage::Terminal;
                    state.current_handler = None;
                    info!(
                        event_name = "orchestrator.conversation_terminated",
                        correlation_id,
                        thread_key = %state.thread_key,
                        escalation_count = state.escalation_count,
                        "escalation bound reached, conversation terminal"
                    );
                    return vec![Message::generated(FALLBACK_REPLY)];
                }
                Routing::Engage(kind) => {
                    state.stage = Stage::Routed;
                    state.current_handler = Some(kind);
                    match self.handlers.get(kind).respond(state) {
                        HandlerOutcome::Reply(messages) => return messages,
                        HandlerOutcome::Escalate { reason } => {
                            state.escalation_count += 1;
                            state.stage = Stage::Escalated;
                            info!(
                                event_name = "orchestrator.handler_escalated",
                                correlation_id,
                                thread_key = %state.thread_key,
                                handler = kind.as_str(),
                                escalation_count = state.escalation_count,
                                reason,
                                "handler returned control to the router"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Per-thread-key leases. In-process locking is the single-writer mechanism;
/// across processes the checkpoint store's last-write-wins ordering applies.
#[derive(Default)]
struct KeyedLocks {
    inner: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if map.len() > 1024 {
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        map.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use triage_agent::scoring::{FixedScoringClient, UnavailableScoringClient};
    use triage_agent::transport::{FlakyTransport, RecordingTransport};
    use triage_core::domain::conversation::Stage;
    use triage_core::router::RoutingPolicy;
    use triage_core::{HandlerKind, Role, ThreadKey};
    use triage_db::{CheckpointStore, InMemoryCheckpointStore};

    use super::{InboundEvent, Orchestrator};

    fn orchestrator(
        store: Arc<InMemoryCheckpointStore>,
        scoring: Arc<dyn triage_agent::ScoringClient>,
        transport: Arc<RecordingTransport>,
    ) -> Orchestrator {
        Orchestrator::new(
            store,
            scoring,
            transport,
            RoutingPolicy::default(),
            Duration::ZERO,
            1,
        )
    }

    fn event(text: &str) -> InboundEvent {
        InboundEvent {
            thread_key: ThreadKey::derive(None, "c-100"),
            contact_id: "c-100".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn first_contact_creates_state_under_the_contact_key() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(2)),
            transport.clone(),
        );

        let summary =
            orchestrator.process_event(event("Hello"), "req-a").await.expect("processed");

        assert_eq!(summary.thread_key.as_str(), "contact-c-100");
        let state = store.get(&summary.thread_key).await.expect("get").expect("present");
        assert_eq!(state.messages[0].role, Role::Human);
        assert_eq!(state.messages[0].content, "Hello");
        assert_eq!(summary.handler, Some(HandlerKind::Cold));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn routing_follows_bands_and_never_reverts_after_score_drops() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::sequence(&[2, 2, 6, 5])),
            transport.clone(),
        );

        let mut handlers = Vec::new();
        for text in ["hi", "still browsing", "ok I have a budget", "actually unsure"] {
            let summary =
                orchestrator.process_event(event(text), "req-b").await.expect("processed");
            handlers.push(summary.handler);
        }

        assert_eq!(
            handlers,
            vec![
                Some(HandlerKind::Cold),
                Some(HandlerKind::Cold),
                Some(HandlerKind::Warm),
                // Raw score suggestion of 5 must not pull the stored score
                // back below the mid band.
                Some(HandlerKind::Warm),
            ]
        );

        let state = store
            .get(&ThreadKey::derive(None, "c-100"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(state.qualification_score, 6);
    }

    #[tokio::test]
    async fn duplicate_delivery_produces_no_net_new_messages_or_sends() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(3)),
            transport.clone(),
        );

        let first = orchestrator.process_event(event("Hello"), "req-c1").await.expect("first");
        let message_count = {
            let state = store.get(&first.thread_key).await.expect("get").expect("present");
            state.messages.len()
        };
        let sends_after_first = transport.sent_count();

        let second =
            orchestrator.process_event(event("Hello"), "req-c2").await.expect("second");

        assert_eq!(second.appended, 0);
        assert_eq!(transport.sent_count(), sends_after_first);
        let state = store.get(&second.thread_key).await.expect("get").expect("present");
        assert_eq!(state.messages.len(), message_count);
    }

    #[tokio::test]
    async fn escalation_bound_terminates_and_sends_the_fallback_reply() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(6)),
            transport.clone(),
        );

        let summary = orchestrator
            .process_event(event("I want to talk to a human please"), "req-d")
            .await
            .expect("processed");

        assert_eq!(summary.stage, Stage::Terminal);
        assert_eq!(summary.handler, None);

        let state = store.get(&summary.thread_key).await.expect("get").expect("present");
        assert_eq!(state.escalation_count, 2);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("teammate"));
    }

    #[tokio::test]
    async fn terminal_stage_is_absorbing_across_events() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(6)),
            transport.clone(),
        );

        orchestrator
            .process_event(event("talk to a human"), "req-e1")
            .await
            .expect("terminates");
        let sends_after_terminal = transport.sent_count();

        let summary = orchestrator
            .process_event(event("hello again"), "req-e2")
            .await
            .expect("processed");

        assert_eq!(summary.stage, Stage::Terminal);
        assert_eq!(summary.handler, None);
        // The responder may still flush, but nothing new was generated.
        assert_eq!(transport.sent_count(), sends_after_terminal);
    }

    #[tokio::test]
    async fn scoring_outage_keeps_prior_score_and_still_replies() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());

        // Establish a warm score first.
        let warm = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(6)),
            transport.clone(),
        );
        warm.process_event(event("budget talk"), "req-f1").await.expect("warm");

        let degraded =
            orchestrator(store.clone(), Arc::new(UnavailableScoringClient), transport.clone());
        let summary =
            degraded.process_event(event("are you there?"), "req-f2").await.expect("processed");

        assert_eq!(summary.score, 6);
        assert_eq!(summary.handler, Some(HandlerKind::Warm));
        let state = store.get(&summary.thread_key).await.expect("get").expect("present");
        assert!(state.last_error.as_deref().unwrap_or("").contains("scoring unavailable"));
    }

    #[tokio::test]
    async fn score_is_monotonic_across_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::sequence(&[4, 9, 2, 3])),
            transport.clone(),
        );

        for (index, text) in ["a", "b", "c", "d"].iter().enumerate() {
            orchestrator
                .process_event(event(text), &format!("req-g{index}"))
                .await
                .expect("processed");
        }

        let history = store
            .list(&ThreadKey::derive(None, "c-100"), 10)
            .await
            .expect("list");
        let mut scores: Vec<u8> =
            history.iter().map(|cp| cp.state.qualification_score).collect();
        scores.reverse();
        assert!(scores.windows(2).all(|pair| pair[0] <= pair[1]), "scores {scores:?}");
        assert_eq!(*scores.last().expect("non-empty"), 9);
    }

    #[tokio::test]
    async fn pending_outbound_holds_only_undelivered_messages() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(FixedScoringClient::always(2)),
            Arc::new(FlakyTransport::failing_first(1)),
            RoutingPolicy::default(),
            Duration::ZERO,
            1,
        );

        let summary =
            orchestrator.process_event(event("Hello"), "req-i1").await.expect("first");
        assert_eq!(summary.sent_count, 0);

        let state = store.get(&summary.thread_key).await.expect("get").expect("present");
        assert_eq!(state.pending_outbound.len(), 1);
        assert!(!state.pending_outbound[0].sent);
        assert!(state.last_error.as_deref().unwrap_or("").contains("send(s) failed"));

        // The transport recovers; the next event drains the backlog and the
        // checkpoint no longer carries pending candidates.
        let summary =
            orchestrator.process_event(event("Are you there?"), "req-i2").await.expect("second");
        assert!(summary.sent_count >= 1);

        let state = store.get(&summary.thread_key).await.expect("get").expect("present");
        assert!(state.pending_outbound.is_empty());
    }

    #[tokio::test]
    async fn events_for_the_same_key_are_serialized() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let orchestrator = Arc::new(orchestrator(
            store.clone(),
            Arc::new(FixedScoringClient::always(2)),
            transport.clone(),
        ));

        let mut tasks = Vec::new();
        for index in 0..8 {
            let orchestrator = orchestrator.clone();
            tasks.push(tokio::spawn(async move {
                orchestrator
                    .process_event(event(&format!("message {index}")), "req-h")
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("processed");
        }

        let state = store
            .get(&ThreadKey::derive(None, "c-100"))
            .await
            .expect("get")
            .expect("present");
        let human_count =
            state.messages.iter().filter(|m| m.role == Role::Human).count();
        assert_eq!(human_count, 8);
    }
}
