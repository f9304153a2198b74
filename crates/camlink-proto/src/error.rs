//! Protocol client errors

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for protocol client operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors raised by the protocol client
#[derive(Debug, Error)]
pub enum ApiError {
    /// Write/subscribe/receive failure on the underlying link
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No reply arrived on the expected topic in time
    #[error("Timeout waiting for '{topic}' after {timeout_ms}ms")]
    Timeout { topic: String, timeout_ms: u64 },

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Unsupported decode type: {0}")]
    UnsupportedDecodeType(String),

    /// A bulk-transfer chunk request did not carry a 4-byte length header
    #[error("Data lenght is not 4, unable to proceed!")]
    TransferHeaderLength,

    /// The device aborted a bulk transfer on its timeout topic
    #[error("File transfer timed out")]
    TransferTimeout,

    /// Reply arrived but had an unexpected shape
    #[error("Unexpected reply to '{command}': {reason}")]
    UnexpectedReply { command: String, reason: String },

    /// Device answered with a non-zero status code
    #[error("Device reported status {code} for '{command}'")]
    DeviceStatus { command: String, code: i64 },
}

impl ApiError {
    /// Check if this error is transient (link or wait failure) rather than a protocol violation
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Timeout { .. })
    }
}

impl From<rmp_serde::encode::Error> for ApiError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ApiError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ApiError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
