//! Legacy slot flashing over the topic protocol
//!
//! Every image of a manifest archive is staged in a device-side buffer,
//! checked, then written to the inactive boot slot:
//!
//! ```text
//! for image in [ssbl_header, ssbl, app_header, app]:
//!     allocate(size) -> upload -> crc32c(buffer) == local?
//!     erase_flash(addr, len rounded to 4 KiB) ... erase_flash_done
//!     write_flash(addr, len) ... write_flash_done
//!     read_flash(addr, len)  ... read_flash_done
//!     crc32c(buffer) == local?
//! set boot_select -> reboot -> reattach -> boot_select == target?
//! ```
//!
//! Uploads are not retried here; a failed upload fails the session.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_container::{Image, ImageType, ManifestArchive};
use camlink_proto::api::check_status;
use camlink_proto::topics::upgrader;
use camlink_proto::{codec, Api, Capability, Command, Message, Value};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::device::DeviceHandle;
use crate::error::{UpgradeError, UpgradeFailure, UpgradeResult};
use crate::events::{EventEmitter, UpgradeContext, UpgradeEvent};
use crate::runtime::UpgradeRuntime;
use crate::session::{UpgradeSession, UpgradeStep};
use crate::settings::{UpgradeOptions, UpgradeSettings};
use crate::upgrader::{upgrade_status_ok, Upgrader, UpgraderKind};

/// CRC-32C (Castagnoli), as computed by the device
pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Flash erase granularity
pub const ERASE_BLOCK: u64 = 4096;

/// Product info key holding the active boot slot
pub const BOOT_SELECT_KEY: &str = "boot_select";

/// Images written to a slot, in order
pub const SLOT_IMAGES: [ImageType; 4] = [
    ImageType::SsblHeader,
    ImageType::Ssbl,
    ImageType::AppHeader,
    ImageType::App,
];

/// First-stage loader location (provisioning only)
pub const FSBL_ADDRESS: u64 = 0x0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSlot {
    A,
    B,
    /// Recovery slot, also used for first-time provisioning
    C,
}

impl BootSlot {
    pub fn base(self) -> u64 {
        match self {
            BootSlot::A => 0x0010_0000,
            BootSlot::B => 0x0090_0000,
            BootSlot::C => 0x0001_0000,
        }
    }

    /// The slot to write while `self` is running
    pub fn inactive(self) -> BootSlot {
        match self {
            BootSlot::A => BootSlot::B,
            BootSlot::B | BootSlot::C => BootSlot::A,
        }
    }

    /// Flash address of `image` within this slot
    pub fn address(self, image: ImageType) -> u64 {
        let offset = match image {
            ImageType::Fsbl => return FSBL_ADDRESS,
            ImageType::SsblHeader => 0x0,
            ImageType::Ssbl => 0x1000,
            ImageType::AppHeader => 0x4_0000,
            ImageType::App => 0x4_1000,
        };
        self.base() + offset
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootSlot::A => "A",
            BootSlot::B => "B",
            BootSlot::C => "C",
        }
    }
}

impl FromStr for BootSlot {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(BootSlot::A),
            "B" | "b" => Ok(BootSlot::B),
            "C" | "c" => Ok(BootSlot::C),
            other => Err(UpgradeError::DeviceStatus {
                operation: "read boot selection".to_string(),
                code: -1,
                message: format!("unknown boot slot '{}'", other),
            }),
        }
    }
}

impl fmt::Display for BootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round `len` up to the next erase block boundary
pub fn erase_length(len: u64) -> u64 {
    len.div_ceil(ERASE_BLOCK) * ERASE_BLOCK
}

// =============================================================================
// Wire structures
// =============================================================================

#[derive(Debug, Serialize)]
struct AllocateRequest {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Serialize)]
struct ChecksumRequest {
    length: u64,
}

#[derive(Debug, Deserialize)]
struct ChecksumReply {
    crc: u32,
}

#[derive(Debug, Serialize)]
struct FlashRequest {
    address: u64,
    length: u64,
}

#[derive(Debug, Deserialize)]
struct FlashProgress {
    offset: u64,
    total: u64,
}

fn flash_progress(msg: &Message) -> Option<f64> {
    let progress: FlashProgress = rmp_serde::from_slice(&msg.payload).ok()?;
    if progress.total == 0 {
        return None;
    }
    Some(progress.offset as f64 / progress.total as f64 * 100.0)
}

/// Read the active boot slot; `None` when no loader is installed
async fn boot_selection(api: &Api) -> UpgradeResult<Option<BootSlot>> {
    let info = api.get_product_info().await?;
    match codec::map_get(&info, BOOT_SELECT_KEY).and_then(Value::as_str) {
        Some(slot) if !slot.is_empty() => Ok(Some(slot.parse()?)),
        _ => Ok(None),
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct LegacyFlashUpgrader {
    runtime: UpgradeRuntime,
    settings: UpgradeSettings,
    archive: Option<ManifestArchive>,
}

impl LegacyFlashUpgrader {
    pub fn new(device: Arc<dyn DeviceHandle>, ctx: UpgradeContext) -> Self {
        Self {
            runtime: UpgradeRuntime::new(device, ctx),
            settings: UpgradeSettings::default(),
            archive: None,
        }
    }

    pub fn session(&self) -> &UpgradeSession {
        self.runtime.session()
    }

    /// Slot chosen by the last run, if it got that far
    pub fn target_slot(&self) -> Option<BootSlot> {
        self.runtime.session().boot_selection()?.parse().ok()
    }

    async fn run(&mut self) -> UpgradeResult<()> {
        let Self {
            runtime,
            settings,
            archive,
        } = self;
        let archive = archive.as_ref().ok_or_else(|| {
            UpgradeError::InvalidOptions("upgrade started before init".to_string())
        })?;

        runtime.begin()?;
        let device = runtime.device();
        let link = device.link();
        let api = link.api()?;
        let emitter = runtime.shared_emitter();
        let flasher = Flasher {
            api,
            emitter: &emitter,
            settings: &*settings,
        };

        let target = match boot_selection(api).await? {
            Some(active) => {
                if archive.has_image(ImageType::Fsbl) {
                    debug!("Loader already installed, ignoring supplied FSBL");
                }
                active.inactive()
            }
            None => {
                let fsbl = archive
                    .image(ImageType::Fsbl)
                    .ok_or(UpgradeError::CannotUpgradeWithoutBootloader)?;
                info!("No loader on device, provisioning through slot C");
                flasher.flash_image(fsbl, FSBL_ADDRESS).await?;
                BootSlot::C
            }
        };
        info!(slot = %target, "Flashing inactive slot");
        runtime.session_mut().choose_boot_selection(target.as_str());
        runtime.session_mut().next_attempt();

        for (index, image_type) in SLOT_IMAGES.iter().enumerate() {
            let image = archive
                .image(*image_type)
                .ok_or(UpgradeError::MissingImage(*image_type))?;
            flasher.flash_image(image, target.address(*image_type)).await?;
            flasher
                .emitter
                .progress("flash", (index + 1) as f64 / SLOT_IMAGES.len() as f64 * 100.0);
        }

        let mut info = api.get_product_info().await?;
        set_map_entry(&mut info, BOOT_SELECT_KEY, Value::from(target.as_str()));
        api.set_product_info(&info).await?;

        runtime.request_reboot().await?;
        let rebooted = runtime.await_reattach().await?;

        runtime.transition(UpgradeStep::VersionVerify);
        let booted = boot_selection(rebooted.link().api()?).await?;
        if booted != Some(target) {
            return Err(UpgradeError::BootSlotMismatch {
                expected: target.to_string(),
                actual: booted.map_or_else(|| "none".to_string(), |s| s.to_string()),
            });
        }
        Ok(())
    }
}

fn set_map_entry(map: &mut Value, key: &str, value: Value) {
    if let Value::Map(entries) = map {
        if let Some(entry) = entries.iter_mut().find(|(k, _)| k.as_str() == Some(key)) {
            entry.1 = value;
            return;
        }
        entries.push((Value::from(key), value));
    } else {
        *map = Value::Map(vec![(Value::from(key), value)]);
    }
}

/// Per-image flashing steps against one device
struct Flasher<'a> {
    api: &'a Api,
    emitter: &'a EventEmitter,
    settings: &'a UpgradeSettings,
}

impl Flasher<'_> {
    #[instrument(skip(self, image), fields(image = %image.image_type, len = image.len()))]
    async fn flash_image(&self, image: &Image, address: u64) -> UpgradeResult<()> {
        let length = image.len() as u64;
        let expected = CASTAGNOLI.checksum(&image.data);
        debug!(address = format!("0x{:08X}", address), crc = format!("0x{:08X}", expected), "Flashing image");

        let reply: StatusReply = self
            .api
            .request(&AllocateRequest { size: length }, &Command::with_reply(upgrader::ALLOCATE), None)
            .await?;
        if reply.status != 0 {
            return Err(UpgradeError::DeviceStatus {
                operation: upgrader::ALLOCATE.to_string(),
                code: reply.status,
                message: format!("cannot allocate {} bytes", length),
            });
        }

        self.upload(image.data.clone()).await?;
        self.verify_checksum(expected, length, "upload").await?;

        let erase = FlashRequest {
            address,
            length: erase_length(length),
        };
        self.flash_command(upgrader::ERASE_FLASH, &erase).await?;

        let region = FlashRequest { address, length };
        self.flash_command(upgrader::WRITE_FLASH, &region).await?;
        self.flash_command(upgrader::READ_FLASH, &region).await?;
        self.verify_checksum(expected, length, "readback").await
    }

    /// Upload into the allocated buffer, probing `write_buf` support once
    async fn upload(&self, data: Bytes) -> UpgradeResult<()> {
        match self.api.write_buf_capability() {
            Capability::Supported => {
                self.api
                    .async_file_transfer(upgrader::WRITE_BUF, data, None)
                    .await?;
                Ok(())
            }
            Capability::Unsupported => self.upload_chunked(data).await,
            Capability::Unknown => {
                match self
                    .api
                    .async_file_transfer(upgrader::WRITE_BUF, data.clone(), None)
                    .await
                {
                    Ok(_) => {
                        self.api.set_write_buf_capability(Capability::Supported);
                        Ok(())
                    }
                    Err(e) => {
                        debug!(error = %e, "write_buf unavailable, using chunked writes");
                        self.api.set_write_buf_capability(Capability::Unsupported);
                        self.upload_chunked(data).await
                    }
                }
            }
        }
    }

    async fn upload_chunked(&self, data: Bytes) -> UpgradeResult<()> {
        let chunk_size = self.api.config().chunk_size.max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let chunk = Value::Map(vec![
                (Value::from("offset"), Value::from(offset as u64)),
                (Value::from("data"), Value::Binary(data[offset..end].to_vec())),
            ]);
            let payload = codec::encode_message_pack(&chunk)?;
            self.api
                .async_file_transfer(upgrader::WRITE, payload, None)
                .await?;
            offset = end;
        }
        Ok(())
    }

    async fn verify_checksum(&self, expected: u32, length: u64, stage: &'static str) -> UpgradeResult<()> {
        let reply: ChecksumReply = self
            .api
            .request(&ChecksumRequest { length }, &Command::with_reply(upgrader::CHECKSUM), None)
            .await?;
        if reply.crc != expected {
            warn!(stage, expected = format!("0x{:08X}", expected), actual = format!("0x{:08X}", reply.crc), "Checksum mismatch");
            return Err(UpgradeError::ChecksumMismatch {
                stage,
                expected,
                actual: reply.crc,
            });
        }
        Ok(())
    }

    /// Run a long flash operation, forwarding its `_status` progress
    async fn flash_command(&self, command: &str, request: &FlashRequest) -> UpgradeResult<()> {
        let payload = rmp_serde::to_vec_named(request).map_err(camlink_proto::ApiError::from)?;
        let operation = command.rsplit('/').next().unwrap_or(command);
        let emitter = self.emitter;

        let done = self
            .api
            .send_and_wait_done(command, &payload, self.settings.status_timeout(), |msg| {
                if let Some(percent) = flash_progress(msg) {
                    emitter.progress(operation, percent);
                }
            })
            .await?;
        let decoded = codec::decode_message_pack(&done.payload)?;
        check_status(command, decoded.as_ref())?;
        Ok(())
    }
}

#[async_trait]
impl Upgrader for LegacyFlashUpgrader {
    fn kind(&self) -> UpgraderKind {
        UpgraderKind::LegacyFlash
    }

    fn init(&mut self, options: &UpgradeOptions) -> UpgradeResult<()> {
        options.validate()?;
        self.archive = Some(ManifestArchive::parse(options.file.clone())?);
        self.settings = options.settings.clone();
        self.runtime.init(&options.settings);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent> {
        self.runtime.context().subscribe()
    }

    async fn start(&mut self) -> Result<Arc<dyn DeviceHandle>, UpgradeFailure> {
        let outcome = self.run().await;
        self.runtime.finish(outcome)
    }

    async fn upgrade_is_valid(&self) -> bool {
        upgrade_status_ok(self.runtime.device().as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_selection() {
        assert_eq!(BootSlot::A.inactive(), BootSlot::B);
        assert_eq!(BootSlot::B.inactive(), BootSlot::A);
        assert_eq!(BootSlot::C.inactive(), BootSlot::A);
        assert!("D".parse::<BootSlot>().is_err());
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(BootSlot::B.address(ImageType::SsblHeader), 0x0090_0000);
        assert_eq!(BootSlot::A.address(ImageType::App), 0x0014_1000);
        assert_eq!(BootSlot::C.address(ImageType::Fsbl), FSBL_ADDRESS);
    }

    #[test]
    fn test_erase_length_rounds_up() {
        assert_eq!(erase_length(0), 0);
        assert_eq!(erase_length(1), 4096);
        assert_eq!(erase_length(4096), 4096);
        assert_eq!(erase_length(4097), 8192);
    }

    #[test]
    fn test_crc32c_check_value() {
        assert_eq!(CASTAGNOLI.checksum(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_set_map_entry_replaces_existing() {
        let mut info = Value::Map(vec![
            (Value::from("serial"), Value::from("X1")),
            (Value::from(BOOT_SELECT_KEY), Value::from("A")),
        ]);
        set_map_entry(&mut info, BOOT_SELECT_KEY, Value::from("B"));
        assert_eq!(
            codec::map_get(&info, BOOT_SELECT_KEY).and_then(Value::as_str),
            Some("B")
        );
        assert_eq!(info.as_map().map(Vec::len), Some(2));
    }

    #[test]
    fn test_flash_progress() {
        let status = |offset: u64, total: u64| {
            let value = Value::Map(vec![
                (Value::from("offset"), Value::from(offset)),
                (Value::from("total"), Value::from(total)),
            ]);
            Message::new("upgrader/erase_flash_status", codec::encode_message_pack(&value).unwrap())
        };
        assert_eq!(flash_progress(&status(50, 200)), Some(25.0));
        assert_eq!(flash_progress(&status(0, 0)), None);
        assert_eq!(flash_progress(&Message::new("x", vec![0xc0])), None);
    }
}
