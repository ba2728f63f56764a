// =============================================================================
// Error Taxonomy — every failure the feed hub can surface
// =============================================================================
//
// Loop-internal failures (transport, protocol, backpressure, subscriber-local)
// are handled where they occur. Only auth failures and the user-facing
// add/remove calls propagate to callers.
// =============================================================================

use thiserror::Error;

use crate::types::{Opcode, SubscriberId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    // ── Queue ───────────────────────────────────────────────────────────
    /// Enqueue on a queue that already holds `capacity` items.
    #[error("queue is overflow")]
    QueueOverflow,

    /// Dequeue on an empty queue. Callers treat this as the idle state.
    #[error("queue is underflow")]
    QueueUnderflow,

    // ── Aggregation ─────────────────────────────────────────────────────
    #[error("no available bars")]
    NoBarsAvailable,

    // ── Auth ────────────────────────────────────────────────────────────
    #[error("broker answered forbidden")]
    AuthForbidden,

    #[error("auth transport failure: {0}")]
    AuthTransport(String),

    #[error("malformed token claims: {0}")]
    AuthClaims(String),

    // ── Transport ───────────────────────────────────────────────────────
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection is not established")]
    NotConnected,

    #[error("connection is closing")]
    Closing,

    // ── Subscribers ─────────────────────────────────────────────────────
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),

    #[error("subscriber is done: {0}")]
    SubscriberDone(SubscriberId),

    #[error("invalid {opcode} payload: {reason}")]
    InvalidPayload { opcode: Opcode, reason: String },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Collaborators ───────────────────────────────────────────────────
    #[error("rest request failed: {0}")]
    Rest(String),
}

impl FeedError {
    /// True for the failures the transport recovers from by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FeedError::Transport(_) | FeedError::NotConnected | FeedError::Closing
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_messages_match_wire_vocabulary() {
        assert_eq!(FeedError::QueueOverflow.to_string(), "queue is overflow");
        assert_eq!(FeedError::QueueUnderflow.to_string(), "queue is underflow");
    }

    #[test]
    fn transport_classification() {
        assert!(FeedError::NotConnected.is_transport());
        assert!(FeedError::Transport("reset".into()).is_transport());
        assert!(!FeedError::AuthForbidden.is_transport());
        assert!(!FeedError::QueueOverflow.is_transport());
    }
}
