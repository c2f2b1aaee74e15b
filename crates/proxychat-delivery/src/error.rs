//! Error types for the delivery subsystem.

use thiserror::Error;

/// Delivery subsystem errors.
///
/// None of these are fatal to the process: the router and the session
/// lifecycle log them and carry on with the next recipient or frame.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Durable store failure (queue push, publish, membership read)
    #[error("Store error: {0}")]
    Store(String),

    /// Message could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message is missing its routing target or names both
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Presence flag could not be updated
    #[error("Presence error: {0}")]
    Presence(String),
}

impl DeliveryError {
    /// Create a new store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new invalid message error.
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create a new presence error.
    pub fn presence(msg: impl Into<String>) -> Self {
        Self::Presence(msg.into())
    }

    /// Whether the error came from the durable store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<redis::RedisError> for DeliveryError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeliveryError>;
