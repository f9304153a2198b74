//! Shared fixtures for the upgrade integration tests
//!
//! `FakeCamera` scripts a [`MockTransport`] so it behaves like a camera's
//! upgrader service: uploads land in a device-side buffer and checksums are
//! computed over that buffer.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use camlink_container::digest::sha256_hex;
use camlink_container::marker::{MARKER, SIGNATURE_LEN};
use camlink_proto::transport::mock::MockTransport;
use camlink_proto::{codec, Api, ApiConfig, Message, TransportError, Value};
use camlink_upgrade::legacy::CASTAGNOLI;
use camlink_upgrade::{
    DeviceHandle, DeviceIdentity, DeviceLink, DeviceStatus, FirmwareService, FirmwareVersion,
    HotplugBus, TopicDevice, UpgradeEvent, UpgradeResult, VersionState,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use zip::write::FileOptions;
use zip::ZipWriter;

pub const SERIAL: &str = "CAM-0042";

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new(SERIAL, "camlink")
}

pub fn pack(value: Value) -> Vec<u8> {
    codec::encode_message_pack(&value).unwrap().to_vec()
}

pub fn map(entries: &[(&str, Value)]) -> Value {
    Value::Map(
        entries
            .iter()
            .map(|(k, v)| (Value::from(*k), v.clone()))
            .collect(),
    )
}

pub fn status_ok() -> Vec<u8> {
    pack(map(&[("status", Value::from(0))]))
}

/// Decode a written MessagePack map field as `u64`
pub fn field_u64(msg: &Message, key: &str) -> Option<u64> {
    let value = codec::decode_message_pack(&msg.payload).ok()??;
    codec::map_get(&value, key)?.as_u64()
}

/// Drain everything published so far
pub fn drain(rx: &mut broadcast::Receiver<UpgradeEvent>) -> Vec<UpgradeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn terminal_count(events: &[UpgradeEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

// =============================================================================
// Topic-protocol camera
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingUpload {
    WriteBuf,
    Write,
    Package,
}

#[derive(Default)]
struct CameraState {
    buffer: Vec<u8>,
    pending: Option<PendingUpload>,
    packages: Vec<Vec<u8>>,
    crc_override: Option<u32>,
}

pub struct FakeCamera {
    pub transport: Arc<MockTransport>,
    pub api: Arc<Api>,
    state: Arc<Mutex<CameraState>>,
}

impl FakeCamera {
    /// A camera reporting `app_version` and, when given, the active `boot_select`
    pub fn new(app_version: &str, boot_select: Option<&str>) -> Self {
        let transport = Arc::new(MockTransport::new());
        let api = Arc::new(Api::new(transport.clone(), ApiConfig::default()));
        let camera = Self {
            transport,
            api,
            state: Arc::new(Mutex::new(CameraState::default())),
        };

        let mut info = vec![
            ("serial", Value::from(SERIAL)),
            ("app_version", Value::from(app_version)),
        ];
        if let Some(slot) = boot_select {
            info.push(("boot_select", Value::from(slot)));
        }
        camera.transport.reply(
            "prodinfo/get_msgpack",
            "prodinfo/get_msgpack_reply",
            pack(map(&info)),
        );
        camera
            .transport
            .reply("prodinfo/set_msgpack", "prodinfo/set_msgpack_reply", status_ok());
        camera
            .transport
            .reply("upgrader/allocate", "upgrader/allocate_reply", status_ok());
        camera.transport.reply(
            "async_file_transfer/status",
            "async_file_transfer/status_reply",
            status_ok(),
        );
        camera
            .transport
            .reply("upgrader/status", "upgrader/status_reply", status_ok());

        camera.script_uploads();
        camera.script_checksum();
        for command in ["upgrader/erase_flash", "upgrader/write_flash", "upgrader/read_flash"] {
            camera.script_flash_command(command);
        }
        camera
    }

    pub fn device(&self) -> Arc<dyn DeviceHandle> {
        Arc::new(TopicDevice::new(identity(), self.api.clone()))
    }

    fn start_upload(&self, command: &str, kind: PendingUpload) {
        let state = self.state.clone();
        self.transport.on_write(command, move |header| {
            let len = codec::decode_message_pack(header)
                .ok()
                .flatten()
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            state.lock().pending = Some(kind);
            Ok(vec![Message::new(
                "async_file_transfer/receive",
                len.to_le_bytes().to_vec(),
            )])
        });
    }

    fn script_uploads(&self) {
        self.start_upload("upgrader/write_buf", PendingUpload::WriteBuf);
        self.start_upload("upgrader/write", PendingUpload::Write);
        self.start_upload("hcp/write", PendingUpload::Package);

        let state = self.state.clone();
        self.transport
            .on_write("async_file_transfer/receive_reply", move |chunk| {
                let mut state = state.lock();
                match state.pending.take() {
                    Some(PendingUpload::WriteBuf) => state.buffer = chunk.to_vec(),
                    Some(PendingUpload::Write) => {
                        let value = codec::decode_message_pack(chunk)
                            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?
                            .unwrap_or(Value::Nil);
                        let offset = codec::map_get(&value, "offset")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as usize;
                        let data = match codec::map_get(&value, "data") {
                            Some(Value::Binary(data)) => data.clone(),
                            _ => Vec::new(),
                        };
                        if offset == 0 {
                            state.buffer.clear();
                        }
                        state.buffer.truncate(offset);
                        state.buffer.extend_from_slice(&data);
                    }
                    Some(PendingUpload::Package) => state.packages.push(chunk.to_vec()),
                    None => {}
                }
                Ok(vec![Message::new("async_file_transfer/done", Vec::new())])
            });
    }

    fn script_checksum(&self) {
        let state = self.state.clone();
        self.transport.on_write("upgrader/checksum", move |_| {
            let state = state.lock();
            let crc = state
                .crc_override
                .unwrap_or_else(|| CASTAGNOLI.checksum(&state.buffer));
            Ok(vec![Message::new(
                "upgrader/checksum_reply",
                pack(map(&[("crc", Value::from(crc))])),
            )])
        });
    }

    fn script_flash_command(&self, command: &'static str) {
        self.transport.on_write(command, move |request| {
            let total = codec::decode_message_pack(request)
                .ok()
                .flatten()
                .and_then(|v| codec::map_get(&v, "length").and_then(Value::as_u64))
                .unwrap_or(0);
            Ok(vec![
                Message::new(
                    format!("{}_status", command),
                    pack(map(&[
                        ("offset", Value::from(total / 2)),
                        ("total", Value::from(total)),
                    ])),
                ),
                Message::new(format!("{}_done", command), status_ok()),
            ])
        });
    }

    /// Device reports `crc` for every checksum request
    pub fn corrupt_checksum(&self, crc: u32) {
        self.state.lock().crc_override = Some(crc);
    }

    /// `upgrader/write_buf` is answered with a transfer timeout
    pub fn without_write_buf(&self) {
        self.transport
            .reply("upgrader/write_buf", "async_file_transfer/timeout", Vec::new());
    }

    pub fn buffer(&self) -> Vec<u8> {
        self.state.lock().buffer.clone()
    }

    pub fn packages(&self) -> Vec<Vec<u8>> {
        self.state.lock().packages.clone()
    }

    /// Fail the first `failures` package uploads with a device transfer timeout
    pub fn flaky_package_upload(&self, failures: usize) {
        let state = self.state.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        self.transport.on_write("hcp/write", move |header| {
            if seen.fetch_add(1, Ordering::SeqCst) < failures {
                return Ok(vec![Message::new("async_file_transfer/timeout", Vec::new())]);
            }
            let len = codec::decode_message_pack(header)
                .ok()
                .flatten()
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            state.lock().pending = Some(PendingUpload::Package);
            Ok(vec![Message::new(
                "async_file_transfer/receive",
                len.to_le_bytes().to_vec(),
            )])
        });
    }

    /// Answer `hpk/run` with `statuses` on `upgrader/status`, then the run reply
    pub fn script_run(&self, statuses: Vec<Value>) {
        self.transport.on_write("hpk/run", move |_| {
            let mut out: Vec<Message> = statuses
                .iter()
                .map(|s| Message::new("upgrader/status", pack(s.clone())))
                .collect();
            out.push(Message::new("hpk/run_reply", status_ok()));
            Ok(out)
        });
    }

    /// Simulate a reboot: the device drops off the bus and `next` appears
    pub fn reboot_into(&self, bus: &HotplugBus, next: Arc<dyn DeviceHandle>) {
        let bus = bus.clone();
        self.transport.on_write("camctrl/reboot", move |_| {
            bus.detach(identity());
            bus.attach(next.clone());
            Ok(Vec::new())
        });
    }
}

pub fn script_status(operation: &str, elapsed: u64, total: u64, errors: u64, reboot: bool) -> Value {
    map(&[
        ("operation", Value::from(operation)),
        ("elapsed_points", Value::from(elapsed)),
        ("total_points", Value::from(total)),
        ("error_count", Value::from(errors)),
        ("reboot", Value::from(reboot)),
    ])
}

// =============================================================================
// Upgrade files
// =============================================================================

/// Distinct, non-trivial content per image
pub fn image_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Manifest archive (zip) holding `images` as `(type, data)`
pub fn manifest_archive(images: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let files: Vec<_> = images
        .iter()
        .map(|(ty, data)| {
            serde_json::json!({
                "name": format!("{}.bin", ty),
                "size": data.len(),
                "sha256": sha256_hex(data),
                "version": "2.1.0",
                "type": ty,
            })
        })
        .collect();
    let manifest = serde_json::json!({
        "manifest_version": 5,
        "version": "2.1.0",
        "files": files,
    });

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("manifest.json", options).unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    for (ty, data) in images {
        zip.start_file(format!("{}.bin", ty), options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn slot_images() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("ssbl_header", image_bytes(1, 512)),
        ("ssbl", image_bytes(2, 9000)),
        ("app_header", image_bytes(3, 512)),
        ("app", image_bytes(4, 40_000)),
    ]
}

/// Marker container holding `files`
pub fn marker_container(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut payload = Vec::new();
    for (name, data) in files {
        header.insert(
            name.to_string(),
            serde_json::json!({
                "offset": payload.len(),
                "size": data.len(),
                "sha256": sha256_hex(data),
            }),
        );
        payload.extend_from_slice(data);
    }
    let mut buf = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();
    buf.extend_from_slice(MARKER);
    buf.extend(std::iter::repeat(b'a').take(SIGNATURE_LEN));
    buf.extend_from_slice(&payload);
    buf
}

/// cpio "newc" archive holding `files`
pub fn newc_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    fn pad4(len: usize) -> usize {
        (4 - len % 4) % 4
    }
    let mut out = Vec::new();
    let mut push = |name: &str, data: &[u8], mode: usize| {
        let namesize = name.len() + 1;
        out.extend_from_slice(b"070701");
        let fields = [0, mode, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, namesize, 0];
        for field in fields {
            out.extend_from_slice(format!("{:08X}", field).as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.resize(out.len() + pad4(110 + namesize), 0);
        out.extend_from_slice(data);
        out.resize(out.len() + pad4(data.len()), 0);
    };
    for &(name, data) in files {
        push(name, data, 0o100644);
    }
    push("TRAILER!!!", &[], 0);
    out
}

// =============================================================================
// Streaming camera
// =============================================================================

#[derive(Default)]
struct ServiceState {
    upgraded: BytesMut,
    upgrade_chunks: usize,
    committed: BytesMut,
    commit_calls: usize,
    reboots: usize,
}

pub struct FakeService {
    state: Mutex<ServiceState>,
    version_state: VersionState,
    status: DeviceStatus,
    reboot: Mutex<Option<(HotplugBus, Arc<dyn DeviceHandle>)>>,
}

impl FakeService {
    pub fn new(version_state: VersionState) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            version_state,
            status: DeviceStatus::ok(),
            reboot: Mutex::new(None),
        }
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn reboot_into(&self, bus: &HotplugBus, next: Arc<dyn DeviceHandle>) {
        *self.reboot.lock() = Some((bus.clone(), next));
    }

    pub fn upgraded(&self) -> Bytes {
        self.state.lock().upgraded.clone().freeze()
    }

    pub fn upgrade_chunks(&self) -> usize {
        self.state.lock().upgrade_chunks
    }

    pub fn committed(&self) -> Bytes {
        self.state.lock().committed.clone().freeze()
    }

    pub fn commit_calls(&self) -> usize {
        self.state.lock().commit_calls
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().reboots
    }
}

#[async_trait]
impl FirmwareService for FakeService {
    async fn upgrade_device(&self, mut chunks: mpsc::Receiver<Bytes>) -> UpgradeResult<DeviceStatus> {
        while let Some(chunk) = chunks.recv().await {
            let mut state = self.state.lock();
            state.upgraded.extend_from_slice(&chunk);
            state.upgrade_chunks += 1;
        }
        Ok(self.status.clone())
    }

    async fn commit_upgrade(&self, mut chunks: mpsc::Receiver<Bytes>) -> UpgradeResult<DeviceStatus> {
        self.state.lock().commit_calls += 1;
        while let Some(chunk) = chunks.recv().await {
            self.state.lock().committed.extend_from_slice(&chunk);
        }
        Ok(self.status.clone())
    }

    async fn firmware_version(&self) -> UpgradeResult<FirmwareVersion> {
        Ok(FirmwareVersion {
            version: "3.0.0".to_string(),
            state: self.version_state.clone(),
        })
    }

    async fn device_status(&self) -> UpgradeResult<DeviceStatus> {
        Ok(self.status.clone())
    }

    async fn reboot(&self) -> UpgradeResult<()> {
        self.state.lock().reboots += 1;
        let next = self.reboot.lock().clone();
        if let Some((bus, device)) = next {
            bus.detach(identity());
            bus.attach(device);
        }
        Ok(())
    }

    async fn close(&self) -> UpgradeResult<()> {
        Ok(())
    }
}

/// Network device backed by a [`FakeService`]
pub struct StreamDevice {
    pub service: Arc<FakeService>,
}

#[async_trait]
impl DeviceHandle for StreamDevice {
    fn identity(&self) -> DeviceIdentity {
        identity()
    }

    fn link(&self) -> DeviceLink {
        DeviceLink::Stream(self.service.clone())
    }

    async fn app_version(&self) -> UpgradeResult<String> {
        Ok(self.service.firmware_version().await?.version)
    }
}
