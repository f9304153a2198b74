//! Protocol client and logging configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Protocol client configuration
///
/// Can be deserialized from any serde format or constructed programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Reply timeout for plain command/reply exchanges (default: 500ms)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Idle timeout between messages of a bulk transfer (default: 5s)
    #[serde(default = "default_file_transfer_timeout_ms")]
    pub file_transfer_timeout_ms: u64,

    /// Chunk size used for the legacy per-chunk upload path (default: 16 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            file_transfer_timeout_ms: default_file_transfer_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_file_transfer_timeout_ms() -> u64 {
    5_000 // 5 seconds
}

fn default_chunk_size() -> usize {
    16 * 1024
}

impl ApiConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn file_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.file_transfer_timeout_ms)
    }
}

/// Logger configuration
///
/// Library code never reads the process environment for log settings; the
/// binary embedding these crates builds a `LogConfig` and calls [`init`].
/// Any other `tracing` subscriber may be installed instead.
///
/// [`init`]: LogConfig::init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Log per-step upgrade progress at info instead of debug
    #[serde(default = "default_true")]
    pub verbose: bool,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            verbose: true,
            json: false,
        }
    }
}

fn default_filter() -> String {
    "camlink_proto=info,camlink_container=info,camlink_upgrade=info".to_string()
}

fn default_true() -> bool {
    true
}

impl LogConfig {
    /// Build the filter; `RUST_LOG` wins when present
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }

    /// Install the global subscriber
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init(&self) -> Result<(), tracing_subscriber::util::TryInitError> {
        let registry = tracing_subscriber::registry().with(self.env_filter());
        if self.json {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
        } else {
            registry.with(tracing_subscriber::fmt::layer()).try_init()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_millis(500));
        assert_eq!(config.file_transfer_timeout(), Duration::from_secs(5));
        assert_eq!(config.chunk_size, 16384);
    }

    #[test]
    fn test_api_config_partial_json() {
        let config: ApiConfig = serde_json::from_str(r#"{"default_timeout_ms": 2000}"#).unwrap();
        assert_eq!(config.default_timeout_ms, 2000);
        assert_eq!(config.file_transfer_timeout_ms, 5000);
    }

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert!(config.verbose);
        assert!(!config.json);
        assert!(config.filter.contains("camlink_upgrade"));
    }
}
