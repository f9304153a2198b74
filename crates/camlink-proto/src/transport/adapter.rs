//! Transport adapter trait and types

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::TransportError;

/// A message received from (or written to) the device, addressed by topic
///
/// This is the raw reply envelope: the protocol client never interprets the
/// payload until the caller asks for a specific decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name, e.g. `upgrader/checksum_reply`
    pub topic: String,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Exclusive topic transport to a single device
///
/// Implementations own the physical link (USB bulk endpoints, HID reports,
/// a socket). Everything the device sends is fanned out on a broadcast
/// channel; a listener is just a [`broadcast::Receiver`] and is removed by
/// dropping it.
#[async_trait]
pub trait TopicTransport: Send + Sync {
    /// Write a payload to a command topic
    async fn write(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Ask the device to start publishing a topic
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Ask the device to stop publishing a topic
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Register a listener for every incoming message
    ///
    /// Messages arriving before this call are not delivered to the returned
    /// receiver, so listeners must be registered before the write that
    /// triggers the reply.
    fn listen(&self) -> broadcast::Receiver<Message>;

    /// Drop any stale buffered input left over from an earlier exchange
    async fn clear(&self) -> Result<(), TransportError>;

    /// Close the link; the transport must not be used afterwards
    async fn close(&self) -> Result<(), TransportError>;

    /// Check whether the link has been closed
    fn is_closed(&self) -> bool;
}
