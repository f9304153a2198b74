//! Top-level upgrade entry point with whole-session retries

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::device::DeviceHandle;
use crate::error::{UpgradeError, UpgradeFailure};
use crate::events::{EventEmitter, UpgradeContext, UpgradeEvent};
use crate::settings::UpgradeOptions;
use crate::upgrader::{Upgrader, UpgraderFactory};

/// Additional attempts after a retryable failure
pub const MAX_RETRIES: u32 = 3;

/// Upgrade `device`, retrying the whole session on retryable failures
///
/// Each retry runs against the device handle carried by the failure, which
/// is the reattached instance when the device rebooted mid-upgrade. A
/// caller-supplied orchestrator in `options` is used for the first attempt
/// only; retries are built by `factory`.
#[instrument(skip_all, fields(device = %device.identity()))]
pub async fn upgrade(
    device: Arc<dyn DeviceHandle>,
    ctx: &UpgradeContext,
    mut options: UpgradeOptions,
    factory: &dyn UpgraderFactory,
) -> Result<Arc<dyn DeviceHandle>, UpgradeFailure> {
    let mut device = device;
    let mut supplied = options.upgrader.take();
    let mut retries = 0;

    loop {
        let attempt = retries + 1;
        match run_once(device.clone(), ctx, &options, factory, supplied.take()).await {
            Ok(upgraded) => {
                info!(attempt, "Upgrade finished");
                return Ok(upgraded);
            }
            Err(failure) if failure.retryable && retries < MAX_RETRIES => {
                retries += 1;
                warn!(attempt, error = %failure.error, "Retryable upgrade failure, starting over");
                if let Some(next) = failure.device {
                    device = next;
                }
            }
            Err(failure) => return Err(failure),
        }
    }
}

async fn run_once(
    device: Arc<dyn DeviceHandle>,
    ctx: &UpgradeContext,
    options: &UpgradeOptions,
    factory: &dyn UpgraderFactory,
    supplied: Option<Box<dyn Upgrader>>,
) -> Result<Arc<dyn DeviceHandle>, UpgradeFailure> {
    let prepared = match supplied {
        Some(upgrader) => Ok(upgrader),
        None => factory.create(device.clone(), ctx).await,
    }
    .and_then(|mut upgrader| {
        upgrader.init(options)?;
        Ok(upgrader)
    });

    match prepared {
        Ok(mut upgrader) => upgrader.start().await,
        Err(error) => Err(abort_before_start(device, ctx, options, error)),
    }
}

/// Fail a session that never reached `start`
///
/// The orchestrator's own runtime never ran, so the terminal event is
/// published here.
fn abort_before_start(
    device: Arc<dyn DeviceHandle>,
    ctx: &UpgradeContext,
    options: &UpgradeOptions,
    error: UpgradeError,
) -> UpgradeFailure {
    warn!(error = %error, code = error.code(), "Upgrade could not start");
    let failure = UpgradeFailure::new(error, Some(device));
    EventEmitter::new(ctx.events.clone(), options.settings.verbose).emit(UpgradeEvent::Failed {
        reason: failure.error.to_string(),
        retryable: failure.retryable,
    });
    failure
}
