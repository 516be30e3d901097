//! Response handler set.
//!
//! One strategy per qualification band. Handlers consume state and produce
//! candidate outbound messages, or ask the router to reconsider; they never
//! invoke one another and they never send anything themselves.

use triage_core::{ConversationState, HandlerKind, Message, Role};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Candidate outbound messages for the responder.
    Reply(Vec<Message>),
    /// Return control to the router without a final reply. Bounded by the
    /// router's escalation limit.
    Escalate { reason: String },
}

pub trait ResponseHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;
    fn respond(&self, state: &ConversationState) -> HandlerOutcome;
}

/// Low band: keep the conversation going and gather basics.
#[derive(Clone, Debug, Default)]
pub struct ColdHandler;

impl ResponseHandler for ColdHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Cold
    }

    fn respond(&self, state: &ConversationState) -> HandlerOutcome {
        let greeting = if state.extracted_fields.contains_key("name") {
            "Thanks for reaching out again!"
        } else {
            "Thanks for reaching out!"
        };
        HandlerOutcome::Reply(vec![Message::generated(format!(
            "{greeting} Could you tell me a bit about what you're looking for \
             and roughly when you'd like to get started?"
        ))])
    }
}

/// Mid band: qualify further. Hands back to the router when the customer
/// explicitly asks for a person.
#[derive(Clone, Debug, Default)]
pub struct WarmHandler;

impl ResponseHandler for WarmHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Warm
    }

    fn respond(&self, state: &ConversationState) -> HandlerOutcome {
        if wants_human(state) {
            return HandlerOutcome::Escalate {
                reason: "customer asked for a human".to_string(),
            };
        }

        let mut missing = Vec::new();
        if !state.extracted_fields.contains_key("budget") {
            missing.push("a rough budget");
        }
        if !state.extracted_fields.contains_key("timeline") {
            missing.push("your ideal timeline");
        }

        let text = if missing.is_empty() {
            "Great, that's everything I need to match you with the right option. \
             Anything else I should know before I line things up?"
                .to_string()
        } else {
            format!(
                "You're in good hands. To point you at the best option, could you share {}?",
                missing.join(" and ")
            )
        };
        HandlerOutcome::Reply(vec![Message::generated(text)])
    }
}

/// High band: move to handoff/booking.
#[derive(Clone, Debug, Default)]
pub struct HotHandler;

impl ResponseHandler for HotHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Hot
    }

    fn respond(&self, state: &ConversationState) -> HandlerOutcome {
        let text = match state.extracted_fields.get("email") {
            Some(email) => format!(
                "Perfect - you're all set. I'm sending a booking link to {email} now; \
                 pick any slot that works and we'll take it from there."
            ),
            None => "Perfect - let's get you booked in. What's the best email or number \
                     to send your confirmation to?"
                .to_string(),
        };
        HandlerOutcome::Reply(vec![Message::generated(text)])
    }
}

fn wants_human(state: &ConversationState) -> bool {
    let Some(last_human) = state
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::Human)
    else {
        return false;
    };
    let text = last_human.content.to_lowercase();
    ["talk to a human", "real person", "speak to someone", "speak to an agent", "human please"]
        .iter()
        .any(|phrase| text.contains(phrase))
}

/// Closed registry: one handler per band, selected only by `HandlerKind`.
pub struct HandlerRegistry {
    cold: ColdHandler,
    warm: WarmHandler,
    hot: HotHandler,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { cold: ColdHandler, warm: WarmHandler, hot: HotHandler }
    }

    pub fn get(&self, kind: HandlerKind) -> &dyn ResponseHandler {
        match kind {
            HandlerKind::Cold => &self.cold,
            HandlerKind::Warm => &self.warm,
            HandlerKind::Hot => &self.hot,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use triage_core::{ConversationState, HandlerKind, Message, ThreadKey};

    use super::{HandlerOutcome, HandlerRegistry, ResponseHandler};

    fn state() -> ConversationState {
        ConversationState::new(ThreadKey::derive(None, "c-1"), "c-1")
    }

    #[test]
    fn registry_maps_each_band_to_its_own_kind() {
        let registry = HandlerRegistry::new();
        for kind in [HandlerKind::Cold, HandlerKind::Warm, HandlerKind::Hot] {
            assert_eq!(registry.get(kind).kind(), kind);
        }
    }

    #[test]
    fn cold_handler_always_replies() {
        let outcome = HandlerRegistry::new().get(HandlerKind::Cold).respond(&state());
        let HandlerOutcome::Reply(messages) = outcome else {
            panic!("cold handler should reply");
        };
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].sent);
    }

    #[test]
    fn warm_handler_asks_for_missing_qualifiers() {
        let outcome = HandlerRegistry::new().get(HandlerKind::Warm).respond(&state());
        let HandlerOutcome::Reply(messages) = outcome else {
            panic!("warm handler should reply");
        };
        assert!(messages[0].content.contains("budget"));
        assert!(messages[0].content.contains("timeline"));
    }

    #[test]
    fn warm_handler_escalates_on_handoff_request() {
        let mut state = state();
        state.merge_messages(vec![Message::human("Can I talk to a human please?")]);

        let outcome = HandlerRegistry::new().get(HandlerKind::Warm).respond(&state);
        assert!(matches!(outcome, HandlerOutcome::Escalate { .. }));
    }

    #[test]
    fn hot_handler_uses_known_contact_channel() {
        let mut state = state();
        state.merge_fields(std::collections::BTreeMap::from([(
            "email".to_string(),
            "dana@example.com".to_string(),
        )]));

        let outcome = HandlerRegistry::new().get(HandlerKind::Hot).respond(&state);
        let HandlerOutcome::Reply(messages) = outcome else {
            panic!("hot handler should reply");
        };
        assert!(messages[0].content.contains("dana@example.com"));
    }
}
