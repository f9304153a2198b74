//! Upgrade by device-side script
//!
//! The whole marker container is uploaded as one bulk transfer, then the
//! device is told to run the script it carries. Progress arrives on
//! `upgrader/status` until an operation named `done` reports whether the
//! device will reboot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_container::MarkerContainer;
use camlink_proto::api::{check_status, next_on_topic};
use camlink_proto::topics::{package, upgrader};
use camlink_proto::{codec, Api, ApiError, Command, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::DeviceHandle;
use crate::error::{UpgradeError, UpgradeFailure, UpgradeResult};
use crate::events::{EventEmitter, UpgradeContext, UpgradeEvent};
use crate::runtime::UpgradeRuntime;
use crate::session::{UpgradeSession, UpgradeStep};
use crate::settings::{UpgradeOptions, UpgradeSettings};
use crate::upgrader::{upgrade_status_ok, Upgrader, UpgraderKind};

/// Name the device stores the uploaded container under
pub const UPGRADE_SCRIPT: &str = "upgrade.hpk";

/// Operation name that ends the status stream
pub const DONE_OPERATION: &str = "done";

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    filename: &'a str,
}

/// One `upgrader/status` message
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptStatus {
    pub operation: String,
    #[serde(default)]
    pub elapsed_points: u64,
    #[serde(default)]
    pub total_points: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub reboot: bool,
}

impl ScriptStatus {
    pub fn percent(&self) -> Option<f64> {
        if self.total_points == 0 {
            return None;
        }
        Some(self.elapsed_points as f64 / self.total_points as f64 * 100.0)
    }
}

fn parse_status(msg: &Message) -> UpgradeResult<ScriptStatus> {
    rmp_serde::from_slice(&msg.payload).map_err(|e| UpgradeError::Api(ApiError::from(e)))
}

/// Follow the status stream until `done`; resolves with the reboot flag
async fn watch_status(
    rx: &mut broadcast::Receiver<Message>,
    timeout: Duration,
    emitter: &EventEmitter,
) -> UpgradeResult<bool> {
    loop {
        let msg = next_on_topic(rx, upgrader::STATUS, timeout).await?;
        let status = parse_status(&msg)?;
        if status.error_count > 0 {
            return Err(UpgradeError::DeviceErrors {
                operation: status.operation,
                error_count: status.error_count,
            });
        }
        if status.operation == DONE_OPERATION {
            debug!(reboot = status.reboot, "Upgrade script finished");
            return Ok(status.reboot);
        }
        if let Some(percent) = status.percent() {
            emitter.progress(&status.operation, percent);
        }
    }
}

async fn run_script(api: &Api, timeout: Duration) -> UpgradeResult<()> {
    let payload = rmp_serde::to_vec_named(&RunRequest {
        filename: UPGRADE_SCRIPT,
    })
    .map_err(ApiError::from)?;
    let reply = api
        .send_and_receive_exclusive(&payload, &Command::with_reply(package::HPK_RUN), Some(timeout))
        .await?;
    let decoded = codec::decode_message_pack(&reply.payload)?;
    check_status(package::HPK_RUN, decoded.as_ref())?;
    Ok(())
}

pub struct ArchiveScriptUpgrader {
    runtime: UpgradeRuntime,
    settings: UpgradeSettings,
    file: Option<Bytes>,
}

impl ArchiveScriptUpgrader {
    pub fn new(device: Arc<dyn DeviceHandle>, ctx: UpgradeContext) -> Self {
        Self {
            runtime: UpgradeRuntime::new(device, ctx),
            settings: UpgradeSettings::default(),
            file: None,
        }
    }

    pub fn session(&self) -> &UpgradeSession {
        self.runtime.session()
    }

    async fn upload(&mut self, api: &Api, file: &Bytes) -> UpgradeResult<()> {
        let attempts = self.settings.upload_attempts;
        let mut last = None;
        for _ in 0..attempts {
            let attempt = self.runtime.session_mut().next_attempt();
            match api
                .async_file_transfer(package::HCP_WRITE, file.clone(), None)
                .await
            {
                Ok(_) => {
                    info!(attempt, len = file.len(), "Upgrade file uploaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Upload attempt failed");
                    self.runtime.transition(UpgradeStep::Retry);
                    last = Some(e);
                }
            }
        }
        Err(UpgradeError::UploadFailed {
            attempts,
            last: last.map_or_else(String::new, |e| e.to_string()),
        })
    }

    async fn run(&mut self) -> UpgradeResult<()> {
        let file = self.file.clone().ok_or_else(|| {
            UpgradeError::InvalidOptions("upgrade started before init".to_string())
        })?;

        self.runtime.begin()?;
        let device = self.runtime.device();
        let link = device.link();
        let api = link.api()?;

        self.upload(api, &file).await?;

        let timeout = self.settings.status_timeout();
        let emitter = self.runtime.emitter();
        let topics = [upgrader::STATUS];
        let reboot = api
            .with_subscribe(&topics, move || async move {
                let mut rx = api.listen();
                let outcome = futures::try_join!(
                    run_script(api, timeout),
                    watch_status(&mut rx, timeout, emitter)
                );
                Ok(outcome.map(|((), reboot)| reboot))
            })
            .await??;

        if reboot {
            self.runtime.request_reboot().await?;
            self.runtime.await_reattach().await?;
            self.runtime.transition(UpgradeStep::VersionVerify);
        } else {
            info!("Device applied the upgrade without rebooting");
        }
        Ok(())
    }
}

#[async_trait]
impl Upgrader for ArchiveScriptUpgrader {
    fn kind(&self) -> UpgraderKind {
        UpgraderKind::ArchiveScript
    }

    fn init(&mut self, options: &UpgradeOptions) -> UpgradeResult<()> {
        options.validate()?;
        let container = MarkerContainer::parse(options.file.clone())?;
        for name in container.file_names() {
            container.extract(name)?;
        }
        self.file = Some(options.file.clone());
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
