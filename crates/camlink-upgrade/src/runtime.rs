//! Session plumbing shared by every orchestrator
//!
//! Owns the current device handle, reacts to hotplug notifications for the
//! device being upgraded, and guarantees exactly one terminal event.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::device::{DeviceHandle, DeviceIdentity, DeviceLink};
use crate::error::{UpgradeError, UpgradeFailure, UpgradeResult};
use crate::events::{EventEmitter, UpgradeContext, UpgradeEvent};
use crate::hotplug::HotplugEvent;
use crate::session::{UpgradeSession, UpgradeStep};
use crate::settings::UpgradeSettings;

pub struct UpgradeRuntime {
    ctx: UpgradeContext,
    identity: DeviceIdentity,
    device: Arc<RwLock<Arc<dyn DeviceHandle>>>,
    emitter: Arc<EventEmitter>,
    session: UpgradeSession,
    hotplug_rx: Option<broadcast::Receiver<HotplugEvent>>,
    reattach_rx: Option<mpsc::Receiver<Arc<dyn DeviceHandle>>>,
    listener: Option<JoinHandle<()>>,
}

impl UpgradeRuntime {
    pub fn new(device: Arc<dyn DeviceHandle>, ctx: UpgradeContext) -> Self {
        let settings = UpgradeSettings::default();
        Self {
            identity: device.identity(),
            device: Arc::new(RwLock::new(device)),
            emitter: Arc::new(EventEmitter::new(ctx.events.clone(), settings.verbose)),
            session: UpgradeSession::new(settings.boot_timeout(), settings.verbose),
            ctx,
            hotplug_rx: None,
            reattach_rx: None,
            listener: None,
        }
    }

    /// Apply settings and register for hotplug notifications
    pub fn init(&mut self, settings: &UpgradeSettings) {
        self.session = UpgradeSession::new(settings.boot_timeout(), settings.verbose);
        self.emitter = Arc::new(EventEmitter::new(self.ctx.events.clone(), settings.verbose));
        self.hotplug_rx = Some(self.ctx.hotplug.subscribe());
        debug!(session = %self.session.id, device = %self.identity, "Upgrade session initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.hotplug_rx.is_some() || self.listener.is_some()
    }

    pub fn context(&self) -> &UpgradeContext {
        &self.ctx
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The current device; changes when the device reattaches
    pub fn device(&self) -> Arc<dyn DeviceHandle> {
        self.device.read().clone()
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Owned handle to the emitter, for work that also updates the session
    pub fn shared_emitter(&self) -> Arc<EventEmitter> {
        self.emitter.clone()
    }

    pub fn session(&self) -> &UpgradeSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut UpgradeSession {
        &mut self.session
    }

    pub fn transition(&mut self, step: UpgradeStep) {
        self.session.transition(step);
    }

    /// Emit `Started` and start following hotplug events
    pub fn begin(&mut self) -> UpgradeResult<()> {
        let mut hotplug_rx = self.hotplug_rx.take().ok_or_else(|| {
            UpgradeError::InvalidOptions("upgrade started before init".to_string())
        })?;
        let (reattach_tx, reattach_rx) = mpsc::channel(4);
        self.reattach_rx = Some(reattach_rx);

        let identity = self.identity.clone();
        let device = self.device.clone();
        let emitter = self.emitter.clone();

        self.listener = Some(tokio::spawn(async move {
            loop {
                match hotplug_rx.recv().await {
                    Ok(HotplugEvent::Detach(id)) if id.matches(&identity) => {
                        info!(device = %id, "Device detached");
                        let current = device.read().clone();
                        if let Err(e) = current.close().await {
                            debug!(error = %e, "Close on detach failed");
                        }
                        emitter.emit(UpgradeEvent::Rebooting);
                    }
                    Ok(HotplugEvent::Attach(new_device)) if new_device.identity().matches(&identity) => {
                        info!(device = %identity, "Device reattached");
                        *device.write() = new_device.clone();
                        if reattach_tx.send(new_device).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        trace!(event = ?other, "Ignoring hotplug event for another device");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Hotplug listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        self.transition(UpgradeStep::Flash);
        self.emitter.emit(UpgradeEvent::Started);
        Ok(())
    }

    /// Ask the device to reboot and release the link to it
    pub async fn request_reboot(&mut self) -> UpgradeResult<()> {
        self.transition(UpgradeStep::RebootRequested);
        let device = self.device();
        match device.link() {
            DeviceLink::Topic(api) => api.reboot("normal").await?,
            DeviceLink::Stream(service) => service.reboot().await?,
        }
        if let Err(e) = device.close().await {
            debug!(error = %e, "Close after reboot request failed");
        }
        Ok(())
    }

    /// Wait for the device to come back, bounded by the boot timeout
    pub async fn await_reattach(&mut self) -> UpgradeResult<Arc<dyn DeviceHandle>> {
        self.transition(UpgradeStep::AwaitingReconnect);
        let boot_timeout = self.session.boot_timeout;
        let rx = self.reattach_rx.as_mut().ok_or_else(|| {
            UpgradeError::InvalidOptions("upgrade started before init".to_string())
        })?;

        match tokio::time::timeout(boot_timeout, rx.recv()).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(UpgradeError::Link("hotplug listener stopped".to_string())),
            Err(_) => Err(UpgradeError::BootTimeout {
                secs: boot_timeout.as_secs(),
            }),
        }
    }

    /// End the session with exactly one terminal event
    pub fn finish(
        &mut self,
        outcome: UpgradeResult<()>,
    ) -> Result<Arc<dyn DeviceHandle>, UpgradeFailure> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let device = self.device();

        match outcome {
            Ok(()) => {
                self.transition(UpgradeStep::Complete);
                self.emitter.emit(UpgradeEvent::Complete(device.clone()));
                Ok(device)
            }
            Err(error @ UpgradeError::BootTimeout { .. }) => {
                warn!(error = %error, "Upgrade timed out");
                self.transition(UpgradeStep::Timeout);
                self.emitter.emit(UpgradeEvent::Timeout);
                Err(UpgradeFailure::new(error, Some(device)))
            }
            Err(error) => {
                warn!(error = %error, code = error.code(), "Upgrade failed");
                self.transition(UpgradeStep::Failed);
                let failure = UpgradeFailure::new(error, Some(device));
                self.emitter.emit(UpgradeEvent::Failed {
                    reason: failure.error.to_string(),
                    retryable: failure.retryable,
                });
                Err(failure)
            }
        }
    }
}

impl Drop for UpgradeRuntime {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
