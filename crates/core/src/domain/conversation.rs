use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dedupe;
use crate::domain::message::Message;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 10;

/// Deterministic identifier partitioning one logical conversation.
///
/// Stable for the lifetime of the conversation: once a state has been
/// checkpointed under a key, the key is never regenerated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(pub String);

impl ThreadKey {
    /// `conv-<id>` when a conversation id is present, `contact-<id>` fallback.
    pub fn derive(conversation_id: Option<&str>, contact_id: &str) -> Self {
        match conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self(format!("conv-{id}")),
            None => Self(format!("contact-{contact_id}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    Qualifying,
    Routed,
    Escalated,
    Terminal,
}

/// Closed set of response strategies. The router selects among these by
/// qualification band; nothing dispatches on runtime type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Cold,
    Warm,
    Hot,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
        }
    }
}

/// The unit of persistence: everything the engine knows about one
/// conversation, snapshotted to the checkpoint store after each event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_key: ThreadKey,
    pub contact_id: String,
    pub messages: Vec<Message>,
    pub extracted_fields: BTreeMap<String, String>,
    pub qualification_score: u8,
    pub stage: Stage,
    pub current_handler: Option<HandlerKind>,
    pub escalation_count: u32,
    pub pending_outbound: Vec<Message>,
    pub last_error: Option<String>,
}

impl ConversationState {
    pub fn new(thread_key: ThreadKey, contact_id: impl Into<String>) -> Self {
        Self {
            thread_key,
            contact_id: contact_id.into(),
            messages: Vec::new(),
            extracted_fields: BTreeMap::new(),
            qualification_score: MIN_SCORE,
            stage: Stage::New,
            current_handler: None,
            escalation_count: 0,
            pending_outbound: Vec::new(),
            last_error: None,
        }
    }

    /// Append only the incoming messages not already present by normalized
    /// identity. Returns how many were actually appended.
    pub fn merge_messages(&mut self, incoming: Vec<Message>) -> usize {
        let fresh = dedupe::dedupe(&self.messages, incoming);
        let appended = fresh.len();
        self.messages.extend(fresh);
        appended
    }

    /// Raise the qualification score, never lowering it. Out-of-range inputs
    /// are clamped into `MIN_SCORE..=MAX_SCORE`.
    pub fn absorb_score(&mut self, raw: u8) {
        let clamped = raw.clamp(MIN_SCORE, MAX_SCORE);
        self.qualification_score = self.qualification_score.max(clamped);
    }

    /// Monotonic field enrichment: a field once set is never cleared, and an
    /// empty value never overwrites a populated one.
    pub fn merge_fields(&mut self, fields: BTreeMap<String, String>) {
        for (name, value) in fields {
            if value.trim().is_empty() {
                continue;
            }
            self.extracted_fields.insert(name, value);
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Terminal
    }
}
