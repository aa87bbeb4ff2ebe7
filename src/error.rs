//! Error types for trading-bus

use thiserror::Error;

/// Errors that can occur on the message bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Stream id is not in the registry (programming error, never retried)
    #[error("Unknown stream: '{0}'")]
    UnknownStream(String),

    /// Payload rejected by the stream's schema before any transport I/O
    #[error("Schema validation failed for stream '{stream}': {reason}")]
    SchemaValidation {
        stream: String,
        reason: String,
    },

    /// Transport unreachable or connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// A consumer handler failed to process a message
    #[error("Handler error: {0}")]
    Handler(String),

    /// A consume loop did not exit within the shutdown grace period
    #[error("Shutdown timed out after {grace_ms}ms with {outstanding} consumer(s) still running")]
    ShutdownTimeout {
        grace_ms: u64,
        outstanding: usize,
    },

    /// Append failure
    #[error("Failed to publish to stream '{stream}': {reason}")]
    Publish {
        stream: String,
        reason: String,
    },

    /// Stream creation or inspection error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer group creation or read error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or invalid message signature
    #[error("Signature error: {0}")]
    Signature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The bus has been closed
    #[error("Message bus is closed")]
    Closed,
}

impl BusError {
    /// Whether the error comes from the connection layer
    pub fn is_connection(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Timeout(_))
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_validation_message() {
        let err = BusError::SchemaValidation {
            stream: "order.request".to_string(),
            reason: "missing field `side`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("order.request"));
        assert!(msg.contains("side"));
    }

    #[test]
    fn test_is_connection() {
        assert!(BusError::Connection("refused".to_string()).is_connection());
        assert!(BusError::Timeout("ping".to_string()).is_connection());
        assert!(!BusError::UnknownStream("x".to_string()).is_connection());
        assert!(!BusError::Closed.is_connection());
    }

    #[test]
    fn test_shutdown_timeout_message() {
        let err = BusError::ShutdownTimeout {
            grace_ms: 500,
            outstanding: 2,
        };
        assert_eq!(
            err.to_string(),
            "Shutdown timed out after 500ms with 2 consumer(s) still running"
        );
    }
}
