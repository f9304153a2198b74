//! Camera firmware upgrade orchestration
//!
//! Three orchestrator variants share one lifecycle:
//! - [`legacy::LegacyFlashUpgrader`] writes manifest-archive images slot by slot
//! - [`archive_script::ArchiveScriptUpgrader`] uploads a marker container and
//!   lets the device run it
//! - [`streamed::StreamedUpgrader`] streams a disk image to network devices
//!
//! [`upgrade`] picks a variant through an [`UpgraderFactory`] and retries
//! the whole session on retryable failures. Lifecycle events are published
//! on the [`UpgradeContext`] broadcast channel.

pub mod archive_script;
pub mod device;
pub mod error;
pub mod events;
pub mod hotplug;
pub mod legacy;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod streamed;
pub mod upgrader;

pub use archive_script::ArchiveScriptUpgrader;
pub use device::{
    DeviceHandle, DeviceIdentity, DeviceLink, DeviceStatus, FirmwareService, FirmwareVersion,
    TopicDevice, VersionState,
};
pub use error::{UpgradeError, UpgradeFailure, UpgradeResult};
pub use events::{EventEmitter, UpgradeContext, UpgradeEvent};
pub use hotplug::{HotplugBus, HotplugEvent};
pub use legacy::{BootSlot, LegacyFlashUpgrader};
pub use retry::{upgrade, MAX_RETRIES};
pub use session::{UpgradeSession, UpgradeStep};
pub use settings::{UpgradeOptions, UpgradeSettings};
pub use streamed::StreamedUpgrader;
pub use upgrader::{AutoUpgraderFactory, Upgrader, UpgraderFactory, UpgraderKind};
