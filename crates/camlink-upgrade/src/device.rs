//! Device handles consumed by the orchestrators
//!
//! The discovery layer owns device lifetimes; orchestrators only see a
//! [`DeviceHandle`] that exposes identity, the link to talk over, and a
//! few facade operations.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_proto::{codec, Api};
use tokio::sync::mpsc;

use crate::error::{UpgradeError, UpgradeResult};

/// Stable identity used to recognise a device across reboots
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub serial: String,
    pub product: String,
}

impl DeviceIdentity {
    pub fn new(serial: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product: product.into(),
        }
    }

    /// Same physical device (serial numbers match)
    pub fn matches(&self, other: &DeviceIdentity) -> bool {
        self.serial == other.serial
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.product, self.serial)
    }
}

/// How the orchestrator talks to a device
#[derive(Clone)]
pub enum DeviceLink {
    /// Command/reply topic protocol (USB/HID)
    Topic(Arc<Api>),
    /// Streaming firmware service (network devices)
    Stream(Arc<dyn FirmwareService>),
}

impl DeviceLink {
    pub fn api(&self) -> UpgradeResult<&Arc<Api>> {
        match self {
            DeviceLink::Topic(api) => Ok(api),
            DeviceLink::Stream(_) => Err(UpgradeError::UnsupportedLink("topic commands")),
        }
    }

    pub fn service(&self) -> UpgradeResult<&Arc<dyn FirmwareService>> {
        match self {
            DeviceLink::Stream(service) => Ok(service),
            DeviceLink::Topic(_) => Err(UpgradeError::UnsupportedLink("firmware streaming")),
        }
    }
}

/// A device as seen by the orchestrators
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn identity(&self) -> DeviceIdentity;

    fn link(&self) -> DeviceLink;

    /// Application firmware version, e.g. `1.4.2`
    async fn app_version(&self) -> UpgradeResult<String>;

    /// Release the link; the handle must not be used afterwards
    async fn close(&self) -> UpgradeResult<()> {
        match self.link() {
            DeviceLink::Topic(api) => Ok(api.close().await?),
            DeviceLink::Stream(service) => service.close().await,
        }
    }
}

impl fmt::Debug for dyn DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceHandle").field(&self.identity()).finish()
    }
}

/// Post-reboot state of newly written firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionState {
    /// Booted but not yet committed
    Unverified,
    Verified,
    Other(String),
}

impl FromStr for VersionState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "unverified" => VersionState::Unverified,
            "verified" => VersionState::Verified,
            _ => VersionState::Other(s.to_string()),
        })
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionState::Unverified => f.write_str("unverified"),
            VersionState::Verified => f.write_str("verified"),
            VersionState::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub version: String,
    pub state: VersionState,
}

/// Status returned by the streaming firmware service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub code: i64,
    pub message: String,
}

impl DeviceStatus {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero status into an error for `operation`
    pub fn check(self, operation: &str) -> UpgradeResult<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(UpgradeError::DeviceStatus {
            operation: operation.to_string(),
            code: self.code,
            message: self.message,
        })
    }
}

/// Firmware service of network-attached devices
///
/// The upload and commit steps are client-streaming calls: the
/// orchestrator feeds chunks through the channel and the service resolves
/// once the device has consumed the stream.
#[async_trait]
pub trait FirmwareService: Send + Sync {
    async fn upgrade_device(&self, chunks: mpsc::Receiver<Bytes>) -> UpgradeResult<DeviceStatus>;

    async fn commit_upgrade(&self, chunks: mpsc::Receiver<Bytes>) -> UpgradeResult<DeviceStatus>;

    async fn firmware_version(&self) -> UpgradeResult<FirmwareVersion>;

    async fn device_status(&self) -> UpgradeResult<DeviceStatus>;

    async fn reboot(&self) -> UpgradeResult<()>;

    async fn close(&self) -> UpgradeResult<()>;
}

/// Product info key holding the application version
pub const APP_VERSION_KEY: &str = "app_version";

/// Device facade over the topic protocol
pub struct TopicDevice {
    identity: DeviceIdentity,
    api: Arc<Api>,
}

impl TopicDevice {
    pub fn new(identity: DeviceIdentity, api: Arc<Api>) -> Self {
        Self { identity, api }
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }
}

#[async_trait]
impl DeviceHandle for TopicDevice {
    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn link(&self) -> DeviceLink {
        DeviceLink::Topic(self.api.clone())
    }

    async fn app_version(&self) -> UpgradeResult<String> {
        let info = self.api.get_product_info().await?;
        codec::map_get(&info, APP_VERSION_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| UpgradeError::DeviceStatus {
                operation: "read app version".to_string(),
                code: -1,
                message: format!("product info has no '{}'", APP_VERSION_KEY),
            })
    }
}
