//! Upgrade settings and options

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{UpgradeError, UpgradeResult};
use crate::upgrader::Upgrader;

/// Tunables shared by every orchestrator
///
/// Can be loaded from TOML or constructed programmatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSettings {
    /// How long to wait for the device to reattach after reboot (default: 30s)
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,

    /// Log per-step progress at info level (default: on)
    #[serde(default = "default_verbose")]
    pub verbose: bool,

    /// Maximum silence between upgrade status messages (default: 60s)
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,

    /// Bulk upload attempts for the archive-script variant (default: 5)
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,

    /// Chunk size for the streamed-transport variant (default: 64 KiB)
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Capacity of the lifecycle event channel (default: 64)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            boot_timeout_secs: default_boot_timeout_secs(),
            verbose: default_verbose(),
            status_timeout_ms: default_status_timeout_ms(),
            upload_attempts: default_upload_attempts(),
            stream_chunk_size: default_stream_chunk_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_boot_timeout_secs() -> u64 {
    30
}

fn default_verbose() -> bool {
    true
}

fn default_status_timeout_ms() -> u64 {
    60_000 // 1 minute
}

fn default_upload_attempts() -> u32 {
    5
}

fn default_stream_chunk_size() -> usize {
    64 * 1024
}

fn default_event_capacity() -> usize {
    64
}

impl UpgradeSettings {
    /// Parse settings from a TOML string
    pub fn from_toml_str(text: &str) -> UpgradeResult<Self> {
        toml::from_str(text).map_err(|e| UpgradeError::InvalidOptions(e.to_string()))
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// Options for one upgrade run
pub struct UpgradeOptions {
    /// The upgrade file (required, non-empty)
    pub file: Bytes,
    pub settings: UpgradeSettings,
    /// Externally constructed orchestrator; bypasses automatic selection
    pub upgrader: Option<Box<dyn Upgrader>>,
}

impl UpgradeOptions {
    pub fn new(file: impl Into<Bytes>) -> Self {
        Self {
            file: file.into(),
            settings: UpgradeSettings::default(),
            upgrader: None,
        }
    }

    pub fn with_settings(mut self, settings: UpgradeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_upgrader(mut self, upgrader: Box<dyn Upgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// Reject options no orchestrator can work with
    pub fn validate(&self) -> UpgradeResult<()> {
        if self.file.is_empty() {
            return Err(UpgradeError::InvalidOptions(
                "upgrade file is required".to_string(),
            ));
        }
        if self.settings.stream_chunk_size == 0 {
            return Err(UpgradeError::InvalidOptions(
                "stream_chunk_size must be positive".to_string(),
            ));
        }
        if self.settings.upload_attempts == 0 {
            return Err(UpgradeError::InvalidOptions(
                "upload_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for UpgradeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeOptions")
            .field("file_len", &self.file.len())
            .field("settings", &self.settings)
            .field("upgrader", &self.upgrader.as_ref().map(|u| u.kind()))
            .finish()
    }
}
