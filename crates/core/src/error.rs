//! Error types for the voxrelay domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all voxrelay operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Completion client errors ---
    #[error("Completion error: {0}")]
    Client(#[from] ClientError),

    // --- Delivery errors ---
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Admission queue errors ---
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transient upstream failure (HTTP 5xx) — retried with linear backoff.
    #[error("Upstream error: {message} (status: {status_code})")]
    Upstream { status_code: u16, message: String },

    /// Any other non-2xx response — surfaced immediately, no retry.
    #[error("Request rejected: {message} (status: {status_code})")]
    Rejected { status_code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ClientError {
    /// Whether the retry loop should make another attempt for this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The host rejected an edit — treated as a rate-limit signal.
    #[error("Edit rate-limited by host: {0}")]
    RateLimited(String),

    #[error("Send failed to {target}: {reason}")]
    SendFailed { target: String, reason: String },

    #[error("Renderer already finalized")]
    Finalized,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot serialization failed: {0}")]
    Snapshot(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Admission queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_displays_correctly() {
        let err = Error::Client(ClientError::Upstream {
            status_code: 503,
            message: "service unavailable".into(),
        });
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("service unavailable"));
    }

    #[test]
    fn transient_classification() {
        let upstream = ClientError::Upstream {
            status_code: 500,
            message: "boom".into(),
        };
        let rejected = ClientError::Rejected {
            status_code: 400,
            message: "bad request".into(),
        };
        assert!(upstream.is_transient());
        assert!(!rejected.is_transient());
        assert!(!ClientError::Network("dns".into()).is_transient());
    }

    #[test]
    fn delivery_error_displays_correctly() {
        let err = Error::Delivery(DeliveryError::SendFailed {
            target: "channel-9".into(),
            reason: "missing permissions".into(),
        });
        assert!(err.to_string().contains("channel-9"));
        assert!(err.to_string().contains("missing permissions"));
    }
}
