//! Streamed disk-image upgrade for network devices

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_container::{ContainerError, CpioArchive};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::device::{DeviceHandle, DeviceStatus, FirmwareService, VersionState};
use crate::error::{UpgradeError, UpgradeFailure, UpgradeResult};
use crate::events::{EventEmitter, UpgradeContext, UpgradeEvent};
use crate::runtime::UpgradeRuntime;
use crate::session::UpgradeStep;
use crate::settings::{UpgradeOptions, UpgradeSettings};
use crate::upgrader::{Upgrader, UpgraderKind};

/// Archive entry holding the disk image
pub const DISK_IMAGE: &str = "disk.img";

/// Chunks buffered ahead of the service
const STREAM_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamCall {
    Upgrade,
    Commit,
}

impl StreamCall {
    fn operation(self) -> &'static str {
        match self {
            StreamCall::Upgrade => "upgrade_device",
            StreamCall::Commit => "commit_upgrade",
        }
    }
}

/// Feed `image` to the service in `chunk_size` pieces
async fn stream_image(
    service: &dyn FirmwareService,
    call: StreamCall,
    image: &Bytes,
    chunk_size: usize,
    emitter: &EventEmitter,
) -> UpgradeResult<DeviceStatus> {
    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    let operation = call.operation();

    let producer = async move {
        let total = image.len();
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            tx.send(image.slice(offset..end))
                .await
                .map_err(|_| UpgradeError::Link(format!("{} stream closed early", operation)))?;
            offset = end;
            emitter.progress(operation, offset as f64 / total as f64 * 100.0);
        }
        Ok::<(), UpgradeError>(())
    };
    let consumer = match call {
        StreamCall::Upgrade => service.upgrade_device(rx),
        StreamCall::Commit => service.commit_upgrade(rx),
    };

    let ((), status) = futures::try_join!(producer, consumer)?;
    debug!(operation, code = status.code, "Stream finished");
    Ok(status)
}

pub struct StreamedUpgrader {
    runtime: UpgradeRuntime,
    settings: UpgradeSettings,
    image: Option<Bytes>,
}

impl StreamedUpgrader {
    pub fn new(device: Arc<dyn DeviceHandle>, ctx: UpgradeContext) -> Self {
        Self {
            runtime: UpgradeRuntime::new(device, ctx),
            settings: UpgradeSettings::default(),
            image: None,
        }
    }

    async fn run(&mut self) -> UpgradeResult<()> {
        let image = self.image.clone().ok_or_else(|| {
            UpgradeError::InvalidOptions("upgrade started before init".to_string())
        })?;
        let chunk_size = self.settings.stream_chunk_size;

        self.runtime.begin()?;
        let device = self.runtime.device();
        let service = device.link().service()?.clone();

        stream_image(
            service.as_ref(),
            StreamCall::Upgrade,
            &image,
            chunk_size,
            self.runtime.emitter(),
        )
        .await?
        .check(StreamCall::Upgrade.operation())?;
        info!(len = image.len(), "Disk image streamed");

        self.runtime.request_reboot().await?;
        let rebooted = self.runtime.await_reattach().await?;

        self.runtime.transition(UpgradeStep::VersionVerify);
        let service = rebooted.link().service()?.clone();
        let version = service.firmware_version().await?;
        if version.state != VersionState::Unverified {
            return Err(UpgradeError::UnexpectedVersionState {
                expected: VersionState::Unverified.to_string(),
                actual: version.state.to_string(),
            });
        }
        info!(version = %version.version, "New firmware booted, committing");

        self.runtime.transition(UpgradeStep::Commit);
        stream_image(
            service.as_ref(),
            StreamCall::Commit,
            &image,
            chunk_size,
            self.runtime.emitter(),
        )
        .await?
        .check(StreamCall::Commit.operation())
    }
}

#[async_trait]
impl Upgrader for StreamedUpgrader {
    fn kind(&self) -> UpgraderKind {
        UpgraderKind::StreamedTransport
    }

    fn init(&mut self, options: &UpgradeOptions) -> UpgradeResult<()> {
        options.validate()?;
        let mut archive = CpioArchive::new(Cursor::new(options.file.clone()))?;
        let image = archive
            .entry(DISK_IMAGE)?
            .read_all()
            .map_err(ContainerError::from)?;
        self.image = Some(Bytes::from(image));
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
        let device = self.runtime.device();
        let Ok(service) = device.link().service().cloned() else {
            return false;
        };
        match service.device_status().await {
            Ok(status) => status.is_ok(),
            Err(e) => {
                debug!(error = %e, "Device status query failed");
                false
            }
        }
    }
}
