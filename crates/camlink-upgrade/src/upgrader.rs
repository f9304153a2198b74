//! Orchestrator capability and variant selection

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use camlink_proto::topics::upgrader;
use camlink_proto::{codec, Command, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::archive_script::ArchiveScriptUpgrader;
use crate::device::{DeviceHandle, DeviceLink};
use crate::error::{UpgradeFailure, UpgradeResult};
use crate::events::{UpgradeContext, UpgradeEvent};
use crate::legacy::LegacyFlashUpgrader;
use crate::settings::UpgradeOptions;
use crate::streamed::StreamedUpgrader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgraderKind {
    /// Slot-by-slot flashing over the topic protocol
    LegacyFlash,
    /// Device-side script run from an uploaded container
    ArchiveScript,
    /// Client-streamed disk image with a commit step
    StreamedTransport,
}

impl fmt::Display for UpgraderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgraderKind::LegacyFlash => f.write_str("legacy-flash"),
            UpgraderKind::ArchiveScript => f.write_str("archive-script"),
            UpgraderKind::StreamedTransport => f.write_str("streamed-transport"),
        }
    }
}

/// A firmware upgrade orchestrator
///
/// `init` validates and stores options, `start` runs the whole session and
/// resolves with the (possibly reattached) device, `upgrade_is_valid` is a
/// post-upgrade sanity check that never fails.
#[async_trait]
pub trait Upgrader: Send + Sync {
    fn kind(&self) -> UpgraderKind;

    fn init(&mut self, options: &UpgradeOptions) -> UpgradeResult<()>;

    /// Lifecycle events of this orchestrator
    fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent>;

    async fn start(&mut self) -> Result<Arc<dyn DeviceHandle>, UpgradeFailure>;

    async fn upgrade_is_valid(&self) -> bool;
}

/// Builds an orchestrator for a device
#[async_trait]
pub trait UpgraderFactory: Send + Sync {
    async fn create(
        &self,
        device: Arc<dyn DeviceHandle>,
        ctx: &UpgradeContext,
    ) -> UpgradeResult<Box<dyn Upgrader>>;
}

/// Query `upgrader/status`; any failure counts as not valid
pub(crate) async fn upgrade_status_ok(device: &dyn DeviceHandle) -> bool {
    let DeviceLink::Topic(api) = device.link() else {
        return false;
    };
    let reply = match api
        .send_and_receive_exclusive(&[], &Command::with_reply(upgrader::STATUS), None)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "Upgrade status query failed");
            return false;
        }
    };
    let decoded = match codec::decode_message_pack(&reply.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "Malformed upgrade status reply");
            return false;
        }
    };
    decoded
        .as_ref()
        .and_then(|v| codec::map_get(v, "status"))
        .and_then(Value::as_i64)
        == Some(0)
}

/// First application version that runs device-side upgrade scripts
pub const ARCHIVE_SCRIPT_MIN_VERSION: [u32; 3] = [1, 3, 0];

/// Leading numeric components of a version string (`"1.4.2-rc1"` -> `[1, 4, 2]`)
pub fn parse_version(version: &str) -> Option<Vec<u32>> {
    let mut parts = Vec::new();
    for part in version.trim().trim_start_matches(['v', 'V']).split('.') {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse() {
            Ok(n) => parts.push(n),
            Err(_) => break,
        }
        // Pre-release suffix ends the numeric part
        if digits.len() != part.len() {
            break;
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// Pick a variant from the link type and reported application version
pub fn select_kind(link: &DeviceLink, app_version: Option<&str>) -> UpgraderKind {
    if matches!(link, DeviceLink::Stream(_)) {
        return UpgraderKind::StreamedTransport;
    }
    match app_version.and_then(parse_version) {
        Some(mut parts) => {
            parts.resize(ARCHIVE_SCRIPT_MIN_VERSION.len(), 0);
            if parts[..] >= ARCHIVE_SCRIPT_MIN_VERSION[..] {
                UpgraderKind::ArchiveScript
            } else {
                UpgraderKind::LegacyFlash
            }
        }
        None => UpgraderKind::LegacyFlash,
    }
}

/// Factory selecting the variant from the device itself
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoUpgraderFactory;

#[async_trait]
impl UpgraderFactory for AutoUpgraderFactory {
    async fn create(
        &self,
        device: Arc<dyn DeviceHandle>,
        ctx: &UpgradeContext,
    ) -> UpgradeResult<Box<dyn Upgrader>> {
        let link = device.link();
        let version = match link {
            DeviceLink::Topic(_) => match device.app_version().await {
                Ok(version) => Some(version),
                Err(e) => {
                    debug!(error = %e, "Could not read app version, assuming legacy firmware");
                    None
                }
            },
            DeviceLink::Stream(_) => None,
        };

        let kind = select_kind(&link, version.as_deref());
        info!(device = %device.identity(), version = ?version, kind = %kind, "Selected upgrader");

        Ok(match kind {
            UpgraderKind::LegacyFlash => Box::new(LegacyFlashUpgrader::new(device, ctx.clone())),
            UpgraderKind::ArchiveScript => Box::new(ArchiveScriptUpgrader::new(device, ctx.clone())),
            UpgraderKind::StreamedTransport => Box::new(StreamedUpgrader::new(device, ctx.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_proto::transport::mock::MockTransport;
    use camlink_proto::{Api, ApiConfig};

    fn topic_link() -> DeviceLink {
        DeviceLink::Topic(Arc::new(Api::new(
            Arc::new(MockTransport::new()),
            ApiConfig::default(),
        )))
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.4.2"), Some(vec![1, 4, 2]));
        assert_eq!(parse_version("v2.0-rc1"), Some(vec![2, 0]));
        assert_eq!(parse_version("1.3.0-beta.4"), Some(vec![1, 3, 0]));
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn test_select_by_version() {
        let link = topic_link();
        assert_eq!(select_kind(&link, Some("1.2.9")), UpgraderKind::LegacyFlash);
        assert_eq!(select_kind(&link, Some("1.3")), UpgraderKind::ArchiveScript);
        assert_eq!(select_kind(&link, Some("2.0.0")), UpgraderKind::ArchiveScript);
        assert_eq!(select_kind(&link, Some("garbage")), UpgraderKind::LegacyFlash);
        assert_eq!(select_kind(&link, None), UpgraderKind::LegacyFlash);
    }
}
