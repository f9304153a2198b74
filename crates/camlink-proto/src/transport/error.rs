//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write to '{topic}' failed: {reason}")]
    WriteFailed { topic: String, reason: String },

    #[error("Subscribe to '{0}' failed")]
    SubscribeFailed(String),

    #[error("Unsubscribe from '{0}' failed")]
    UnsubscribeFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}
