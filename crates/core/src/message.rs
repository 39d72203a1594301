//! Message, turn, and session key domain types.
//!
//! These are the core value objects that flow through the pipeline:
//! a platform message becomes a `ConversationTurn` in the memory store,
//! history is reformatted into `Message`s for the completion service, and
//! the assistant's reply comes back as another turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured key identifying a conversation session.
///
/// A session is one conversation scope — a voice channel, a DM, a guild
/// text channel. The `scope` groups related sessions (e.g. one guild) so
/// they can be cleared together; the `id` identifies the session within
/// that scope. A structured pair avoids the collision and formatting bugs
/// of string-concatenated composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub scope: String,
    pub id: String,
}

impl SessionKey {
    pub fn new(scope: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.id)
    }
}

impl std::str::FromStr for SessionKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((scope, id)) if !scope.is_empty() && !id.is_empty() => {
                Ok(Self::new(scope, id))
            }
            _ => Err(format!("invalid session key: {s:?}")),
        }
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions (persona, rules)
    System,
}

/// A single prompt message sent to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// One recorded exchange in a session's conversation history.
///
/// Owned exclusively by the memory store. Non-permanent turns expire and
/// are evicted; permanent turns survive both the expiry sweep and the
/// size cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// When this turn was recorded
    pub timestamp: DateTime<Utc>,

    /// Who produced the content
    pub role: Role,

    /// Platform user ID of the speaker (user turns only)
    #[serde(default, rename = "userId", skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,

    /// Display name of the speaker (user turns only)
    #[serde(default, rename = "username", skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,

    /// The text content
    pub content: String,

    /// Exempt from expiry and eviction
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub permanent: bool,
}

impl ConversationTurn {
    /// Create a turn timestamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            speaker_id: None,
            speaker_name: None,
            content: content.into(),
            permanent: false,
        }
    }

    pub fn with_speaker(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.speaker_id = Some(id.into());
        self.speaker_name = Some(name.into());
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Age of this turn relative to `now`, in milliseconds.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }
}

/// A tool definition sent to the completion service so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A completed, validated tool invocation emitted by the streaming client.
///
/// Only produced once the argument fragments have fully accumulated and
/// parsed as a JSON object — malformed calls are discarded upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display_and_parse() {
        let key = SessionKey::new("guild-42", "voice-7");
        assert_eq!(key.to_string(), "guild-42:voice-7");

        let parsed: SessionKey = "guild-42:voice-7".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn session_key_rejects_malformed() {
        assert!("no-separator".parse::<SessionKey>().is_err());
        assert!(":missing-scope".parse::<SessionKey>().is_err());
    }

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello there");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello there");
    }

    #[test]
    fn turn_builder_and_age() {
        let turn = ConversationTurn::new(Role::User, "hi")
            .with_speaker("u1", "Alice")
            .permanent();
        assert!(turn.permanent);
        assert_eq!(turn.speaker_name.as_deref(), Some("Alice"));
        assert!(turn.age_ms(Utc::now()) >= 0);
    }

    #[test]
    fn turn_serialization_omits_defaults() {
        let turn = ConversationTurn::new(Role::Assistant, "reply");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(!json.contains("permanent"));
        assert!(!json.contains("userId"));

        let back: ConversationTurn = serde_json::from_str(&json).unwrap();
        assert!(!back.permanent);
        assert_eq!(back.content, "reply");
    }

    #[test]
    fn tool_invocations_compare_by_value() {
        let a = ToolInvocation {
            name: "set_timer".into(),
            arguments: serde_json::json!({"minutes": 5}),
        };
        assert_eq!(a, a.clone());
        assert_ne!(
            a,
            ToolInvocation {
                name: "set_timer".into(),
                arguments: serde_json::json!({"minutes": 10}),
            }
        );
    }

    #[test]
    fn turn_speaker_fields_use_wire_names() {
        let turn = ConversationTurn::new(Role::User, "hi").with_speaker("u1", "Alice");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["username"], "Alice");
    }
}
