//! Error types for a3s-flowhub

use thiserror::Error;

/// Errors that can occur in the hub, the flow store, or the remote bridge
#[derive(Debug, Error)]
pub enum HubError {
    /// The subscriber name is already active on the topic
    #[error("Subscriber '{subscriber}' is already subscribed to topic '{topic}'")]
    AlreadySubscribed { topic: String, subscriber: String },

    /// Type identifier outside the registered range
    #[error("TID[{0}] out of range")]
    OutOfRange(u32),

    /// Record type was never registered with the type registry
    #[error("Type not registered: {0}")]
    UnregisteredType(String),

    /// Flow store operation attempted in the wrong open mode
    #[error("Invalid mode for {operation}: store is {mode}")]
    InvalidMode {
        operation: &'static str,
        mode: String,
    },

    /// Flow log exhausted; replay termination signal
    #[error("End of flow log")]
    EndOfLog,

    /// Flow log was written with a different type registration order
    #[error("Schema mismatch in {path}: {reason}")]
    SchemaMismatch { path: String, reason: String },

    /// Handle used after close
    #[error("Flow store is closed")]
    Closed,

    /// Per-subscriber delivery did not complete within the publish timeout
    #[error("Delivery to '{subscriber}' on topic '{topic}' timed out")]
    DeliveryTimeout { topic: String, subscriber: String },

    /// Subscriber channel closed or subscription cancelled during delivery
    #[error("Subscriber '{subscriber}' on topic '{topic}' is closed")]
    SubscriberClosed { topic: String, subscriber: String },

    /// No subscription with this id
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Record payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Listen/dial or connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame or unexpected message on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the remote peer
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Hub has been released
    #[error("Hub is stopped")]
    Stopped,
}

impl HubError {
    /// True for the normal replay-termination signal
    pub fn is_end_of_log(&self) -> bool {
        matches!(self, HubError::EndOfLog)
    }

    pub(crate) fn lock(e: impl std::fmt::Display) -> Self {
        HubError::Config(format!("Lock poisoned: {}", e))
    }
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
