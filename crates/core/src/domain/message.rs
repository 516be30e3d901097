use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical author of a message, independent of how the wire labelled it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Generated,
    System,
    Unknown,
}

impl Role {
    /// Fold the role aliases seen across webhook payloads and CRM exports
    /// into one logical role. Unrecognized labels become `Unknown` rather
    /// than failing, so a malformed record can still be compared.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "human" | "user" | "customer" | "contact" | "inbound" => Self::Human,
            "generated" | "assistant" | "bot" | "ai" | "agent" | "outbound" => Self::Generated,
            "system" => Self::System,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Generated => "generated",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub sent: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), sent: false, created_at: Utc::now() }
    }

    /// An inbound message from the end customer.
    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    /// An outbound candidate. `sent` stays false until the responder has a
    /// successful transport acknowledgement.
    pub fn generated(content: impl Into<String>) -> Self {
        Self::new(Role::Generated, content)
    }

    /// Build a message from any of the wire shapes the platform emits.
    ///
    /// Accepted shapes:
    /// - `{"role": ..., "content": ...}`
    /// - `{"type": ..., "text": ...}`
    /// - `{"direction": ..., "body": ...}`
    /// - a bare JSON string (role becomes `Unknown`)
    ///
    /// Never fails: anything else yields an `Unknown`-role message carrying
    /// the raw JSON as content.
    pub fn from_wire(value: &serde_json::Value) -> Self {
        if let Some(text) = value.as_str() {
            return Self::new(Role::Unknown, text);
        }

        let role_label = value
            .get("role")
            .or_else(|| value.get("type"))
            .or_else(|| value.get("direction"))
            .and_then(serde_json::Value::as_str);
        let content = value
            .get("content")
            .or_else(|| value.get("text"))
            .or_else(|| value.get("body"))
            .and_then(serde_json::Value::as_str);

        match (role_label, content) {
            (Some(role), Some(content)) => Self::new(Role::parse(role), content),
            (None, Some(content)) => Self::new(Role::Unknown, content),
            _ => Self::new(Role::Unknown, value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Message, Role};

    #[test]
    fn role_aliases_fold_to_logical_roles() {
        assert_eq!(Role::parse("user"), Role::Human);
        assert_eq!(Role::parse(" HUMAN "), Role::Human);
        assert_eq!(Role::parse("assistant"), Role::Generated);
        assert_eq!(Role::parse("bot"), Role::Generated);
        assert_eq!(Role::parse("system"), Role::System);
        assert_eq!(Role::parse("telepathy"), Role::Unknown);
    }

    #[test]
    fn wire_shapes_collapse_to_the_same_message() {
        let a = Message::from_wire(&json!({"role": "user", "content": "Hi there"}));
        let b = Message::from_wire(&json!({"type": "inbound", "text": "Hi there"}));
        let c = Message::from_wire(&json!({"direction": "inbound", "body": "Hi there"}));

        assert_eq!(a.role, Role::Human);
        assert_eq!(b.role, Role::Human);
        assert_eq!(c.role, Role::Human);
        assert_eq!(a.content, b.content);
        assert_eq!(b.content, c.content);
    }

    #[test]
    fn bare_string_becomes_unknown_role() {
        let message = Message::from_wire(&json!("loose text"));
        assert_eq!(message.role, Role::Unknown);
        assert_eq!(message.content, "loose text");
    }

    #[test]
    fn unrecognized_object_is_preserved_as_raw_content() {
        let message = Message::from_wire(&json!({"weird": true}));
        assert_eq!(message.role, Role::Unknown);
        assert!(message.content.contains("weird"));
    }

    #[test]
    fn serde_round_trip_preserves_sent_flag() {
        let mut message = Message::generated("On our way");
        message.sent = true;

        let encoded = serde_json::to_string(&message).expect("encode");
        let decoded: Message = serde_json::from_str(&encoded).expect("decode");

        assert_eq!(decoded, message);
    }
}
