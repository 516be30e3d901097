//! Wire-shape-agnostic message identity.
//!
//! The same logical message can arrive more than once (webhook retries) and
//! in more than one representation (webhook payloads vs. CRM exports).
//! Identity is `(logical role, canonical content)`; concatenation without
//! this merge is exactly the unbounded-growth bug this module exists to
//! prevent.

use std::collections::HashSet;

use crate::domain::message::{Message, Role};

/// Normalized identity of a message.
///
/// Known roles compare by canonicalized content; `Unknown`-role entries are
/// compared by raw content only, since we cannot assume their formatting.
pub fn normalize(message: &Message) -> (Role, String) {
    match message.role {
        Role::Unknown => (Role::Unknown, message.content.clone()),
        role => (role, canonical_content(&message.content)),
    }
}

/// The subset of `incoming` not already present in `existing`, in incoming
/// order. Duplicates inside `incoming` itself are also collapsed to their
/// first occurrence. Pure and total; never errors on malformed entries.
pub fn dedupe(existing: &[Message], incoming: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<(Role, String)> = existing.iter().map(normalize).collect();
    incoming.into_iter().filter(|message| seen.insert(normalize(message))).collect()
}

/// Remove internal duplicates from one sequence, keeping first occurrences.
pub fn collapse(all: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    all.into_iter().filter(|message| seen.insert(normalize(message))).collect()
}

fn canonical_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
