//! Upgrade lifecycle notifications

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::DeviceHandle;
use crate::hotplug::HotplugBus;
use crate::settings::UpgradeSettings;

/// Consumer-observable lifecycle event
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    Started,
    Progress { operation: String, percent: f64 },
    /// The device dropped off the bus after a reboot request
    Rebooting,
    /// Terminal: carries the reconnected device
    Complete(Arc<dyn DeviceHandle>),
    /// Terminal
    Failed { reason: String, retryable: bool },
    /// Terminal: the device did not come back within the boot timeout
    Timeout,
}

impl UpgradeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeEvent::Complete(_) | UpgradeEvent::Failed { .. } | UpgradeEvent::Timeout
        )
    }
}

/// Channels shared by every attempt of an upgrade
///
/// Retries create new orchestrators but keep the same context, so a consumer
/// subscribes once and sees all attempts.
#[derive(Clone)]
pub struct UpgradeContext {
    pub hotplug: HotplugBus,
    pub events: broadcast::Sender<UpgradeEvent>,
}

impl UpgradeContext {
    pub fn new(hotplug: HotplugBus, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self { hotplug, events }
    }

    pub fn from_settings(hotplug: HotplugBus, settings: &UpgradeSettings) -> Self {
        Self::new(hotplug, settings.event_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent> {
        self.events.subscribe()
    }
}

/// Per-session event publisher
///
/// At most one terminal event is published per emitter; anything after it
/// is dropped.
pub struct EventEmitter {
    tx: broadcast::Sender<UpgradeEvent>,
    terminated: AtomicBool,
    verbose: bool,
}

impl EventEmitter {
    pub fn new(tx: broadcast::Sender<UpgradeEvent>, verbose: bool) -> Self {
        Self {
            tx,
            terminated: AtomicBool::new(false),
            verbose,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent> {
        self.tx.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Publish `event`; returns false if the session already terminated
    pub fn emit(&self, event: UpgradeEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::SeqCst) {
                warn!(event = ?event, "Dropping terminal event after session end");
                return false;
            }
        } else if self.is_terminated() {
            debug!(event = ?event, "Dropping event after session end");
            return false;
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
        true
    }

    pub fn progress(&self, operation: &str, percent: f64) {
        if self.verbose {
            info!(operation, percent = format!("{:.1}", percent), "Upgrade progress");
        } else {
            debug!(operation, percent, "Upgrade progress");
        }
        self.emit(UpgradeEvent::Progress {
            operation: operation.to_string(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_terminal_event_is_published() {
        let (tx, mut rx) = broadcast::channel(8);
        let emitter = EventEmitter::new(tx, false);

        assert!(emitter.emit(UpgradeEvent::Started));
        assert!(emitter.emit(UpgradeEvent::Failed {
            reason: "boom".into(),
            retryable: false
        }));
        assert!(!emitter.emit(UpgradeEvent::Timeout));
        assert!(!emitter.emit(UpgradeEvent::Rebooting));

        assert!(matches!(rx.try_recv().unwrap(), UpgradeEvent::Started));
        assert!(matches!(rx.try_recv().unwrap(), UpgradeEvent::Failed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_progress_event() {
        let (tx, mut rx) = broadcast::channel(8);
        let emitter = EventEmitter::new(tx, true);
        emitter.progress("erase_flash", 50.0);

        match rx.try_recv().unwrap() {
            UpgradeEvent::Progress { operation, percent } => {
                assert_eq!(operation, "erase_flash");
                assert_eq!(percent, 50.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
