//! Upgrade errors and failure reports

use std::sync::Arc;

use camlink_container::{ContainerError, ImageType};
use camlink_proto::ApiError;
use thiserror::Error;

use crate::device::DeviceHandle;

/// Result type alias for upgrade operations
pub type UpgradeResult<T> = Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("Protocol error: {0}")]
    Api(#[from] ApiError),

    #[error("Upgrade file error: {0}")]
    Container(#[from] ContainerError),

    /// Options rejected by `init`, or `start` without `init`
    #[error("Invalid upgrade options: {0}")]
    InvalidOptions(String),

    /// Local CRC32C differs from the one computed by the device
    #[error("Checksum mismatch after {stage}: expected 0x{expected:08X}, device reported 0x{actual:08X}")]
    ChecksumMismatch {
        stage: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("Device reported {error_count} error(s) during '{operation}'")]
    DeviceErrors { operation: String, error_count: u64 },

    #[error("Device returned status {code} for {operation}: {message}")]
    DeviceStatus {
        operation: String,
        code: i64,
        message: String,
    },

    #[error("Unexpected firmware version state '{actual}' (expected '{expected}')")]
    UnexpectedVersionState { expected: String, actual: String },

    #[error("Device booted from slot {actual} after upgrading slot {expected}")]
    BootSlotMismatch { expected: String, actual: String },

    #[error("Cannot upgrade without bootloader")]
    CannotUpgradeWithoutBootloader,

    #[error("Upgrade file has no {0} image")]
    MissingImage(ImageType),

    #[error("Device link does not support {0}")]
    UnsupportedLink(&'static str),

    #[error("Upload failed after {attempts} attempt(s): {last}")]
    UploadFailed { attempts: u32, last: String },

    /// Streamed-transport link failure
    #[error("Link error: {0}")]
    Link(String),

    #[error("Device did not reconnect within {secs}s")]
    BootTimeout { secs: u64 },
}

impl UpgradeError {
    /// Check if a fresh attempt against the (possibly reattached) device may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            UpgradeError::Api(e) => e.is_transient(),
            UpgradeError::UploadFailed { .. } | UpgradeError::Link(_) => true,
            _ => false,
        }
    }

    /// Short stable code for support purposes
    pub fn code(&self) -> &'static str {
        match self {
            UpgradeError::Api(_) => "UPG-001",
            UpgradeError::Container(_) => "UPG-002",
            UpgradeError::InvalidOptions(_) => "UPG-003",
            UpgradeError::ChecksumMismatch { .. } => "UPG-010",
            UpgradeError::DeviceErrors { .. } => "UPG-011",
            UpgradeError::DeviceStatus { .. } => "UPG-012",
            UpgradeError::UnexpectedVersionState { .. } => "UPG-013",
            UpgradeError::BootSlotMismatch { .. } => "UPG-014",
            UpgradeError::CannotUpgradeWithoutBootloader => "UPG-015",
            UpgradeError::MissingImage(_) => "UPG-016",
            UpgradeError::UnsupportedLink(_) => "UPG-017",
            UpgradeError::UploadFailed { .. } => "UPG-020",
            UpgradeError::Link(_) => "UPG-021",
            UpgradeError::BootTimeout { .. } => "UPG-030",
        }
    }
}

/// A terminated upgrade attempt
///
/// Carries the device handle current at the time of failure, which may be a
/// reattached instance, so a retry can continue against it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct UpgradeFailure {
    #[source]
    pub error: UpgradeError,
    pub retryable: bool,
    pub device: Option<Arc<dyn DeviceHandle>>,
}

impl UpgradeFailure {
    pub fn new(error: UpgradeError, device: Option<Arc<dyn DeviceHandle>>) -> Self {
        Self {
            retryable: error.is_retryable(),
            error,
            device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_proto::TransportError;

    #[test]
    fn test_retry_classification() {
        assert!(UpgradeError::Api(ApiError::Transport(TransportError::ConnectionClosed)).is_retryable());
        assert!(UpgradeError::UploadFailed {
            attempts: 5,
            last: "timeout".into()
        }
        .is_retryable());
        assert!(!UpgradeError::ChecksumMismatch {
            stage: "upload",
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!UpgradeError::BootTimeout { secs: 30 }.is_retryable());
        assert!(!UpgradeError::Api(ApiError::TransferHeaderLength).is_retryable());
    }

    #[test]
    fn test_checksum_message_names_both_values() {
        let err = UpgradeError::ChecksumMismatch {
            stage: "upload",
            expected: 0x1234_5678,
            actual: 0xDEAD_BEEF,
        };
        let text = err.to_string();
        assert!(text.contains("0x12345678"));
        assert!(text.contains("0xDEADBEEF"));
        assert_eq!(err.code(), "UPG-010");
    }
}
