//! Delivery surface traits — the abstraction over the host chat platform.
//!
//! The pipeline never talks to a platform SDK directly. It sends and edits
//! messages through `DeliverySurface`, and plays voice responses through
//! `SpeechSink`. Implementations live with the platform integration and
//! handle authentication, connection state, and payload formatting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::message::SessionKey;

/// Opaque handle to a message previously sent on the host platform.
///
/// The surface implementation decides what goes inside (typically a
/// channel-id/message-id pair encoded however the platform needs it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle(pub String);

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The outbound message surface of the host platform.
///
/// Contract: `send` and `edit` are at-least-once; the pipeline achieves
/// idempotency by editing a single message rather than re-sending.
/// The edit-rate ceiling the host enforces is *not* exposed here — staying
/// under it is the delivery scheduler's job.
#[async_trait]
pub trait DeliverySurface: Send + Sync {
    /// Send a new message to the given target (channel/DM id).
    async fn send(
        &self,
        target: &str,
        content: &str,
    ) -> std::result::Result<MessageHandle, DeliveryError>;

    /// Replace the content of a previously sent message.
    async fn edit(
        &self,
        handle: &MessageHandle,
        content: &str,
    ) -> std::result::Result<(), DeliveryError>;

    /// Maximum single-message content length the platform accepts.
    fn max_message_len(&self) -> usize {
        2000
    }
}

/// Sink for sentence-level voice output.
///
/// The streaming client emits sentence/clause units; whoever owns the
/// voice connection turns them into audio.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    /// Speak one sentence-sized unit of text in the given session.
    async fn say(
        &self,
        session: &SessionKey,
        text: &str,
    ) -> std::result::Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_handle_roundtrip() {
        let handle = MessageHandle("chan-1/msg-99".into());
        let json = serde_json::to_string(&handle).unwrap();
        let back: MessageHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
        assert_eq!(handle.to_string(), "chan-1/msg-99");
    }
}
