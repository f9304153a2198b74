//! Hotplug notifications from the discovery layer

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::device::{DeviceHandle, DeviceIdentity};

#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A device appeared; carries a fresh handle
    Attach(Arc<dyn DeviceHandle>),
    /// A device disappeared
    Detach(DeviceIdentity),
}

impl HotplugEvent {
    pub fn identity(&self) -> DeviceIdentity {
        match self {
            HotplugEvent::Attach(device) => device.identity(),
            HotplugEvent::Detach(identity) => identity.clone(),
        }
    }
}

/// Typed ATTACH/DETACH bus
///
/// The discovery backend publishes; orchestrators subscribe. A listener is
/// removed by dropping its receiver.
#[derive(Clone)]
pub struct HotplugBus {
    tx: broadcast::Sender<HotplugEvent>,
}

impl Default for HotplugBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl HotplugBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HotplugEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns the number of listeners that received it
    pub fn publish(&self, event: HotplugEvent) -> usize {
        debug!(event = ?event, "Hotplug");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn attach(&self, device: Arc<dyn DeviceHandle>) -> usize {
        self.publish(HotplugEvent::Attach(device))
    }

    pub fn detach(&self, identity: DeviceIdentity) -> usize {
        self.publish(HotplugEvent::Detach(identity))
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
