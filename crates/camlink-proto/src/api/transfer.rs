//! Chunked bulk transfer
//!
//! The device drives the exchange by publishing one of four topics under a
//! common prefix:
//!
//! - `<prefix>/data`: the device pushes a chunk; the client acknowledges on
//!   `<prefix>/data_reply` and accumulates it
//! - `<prefix>/receive`: the device asks for the next chunk of the buffer
//!   held by the client; the payload is a 4-byte little-endian length and
//!   the chunk is written to `<prefix>/receive_reply`
//! - `<prefix>/done`: the transfer is complete
//! - `<prefix>/timeout`: the device gave up
//!
//! The first of `data`/`receive` to arrive fixes the direction.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rmpv::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};

use super::{check_status, next_on_any, Api, Command};
use crate::codec;
use crate::error::{ApiError, ApiResult};
use crate::topics;
use crate::transport::{Message, TopicTransport};

/// Topic set of one bulk-transfer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTopics {
    prefix: String,
}

impl Default for TransferTopics {
    fn default() -> Self {
        Self::new(topics::ASYNC_FILE_TRANSFER)
    }
}

impl TransferTopics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn topic(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    pub fn data(&self) -> String {
        self.topic("data")
    }

    pub fn data_reply(&self) -> String {
        self.topic("data_reply")
    }

    pub fn receive(&self) -> String {
        self.topic("receive")
    }

    pub fn receive_reply(&self) -> String {
        self.topic("receive_reply")
    }

    pub fn done(&self) -> String {
        self.topic("done")
    }

    pub fn timeout(&self) -> String {
        self.topic("timeout")
    }

    pub fn status(&self) -> String {
        self.topic("status")
    }

    pub fn status_reply(&self) -> String {
        self.topic("status_reply")
    }

    /// Topics the device publishes during a transfer
    pub fn inbound(&self) -> Vec<String> {
        vec![self.data(), self.receive(), self.done(), self.timeout()]
    }
}

/// Direction of a bulk transfer, fixed by the first chunk message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Device pushes `data`
    Download,
    /// Device pulls with `receive`
    Upload,
}

/// One bulk transfer in progress
///
/// The listener is registered when the transfer is created, so it must be
/// created before the command that starts the transfer is written. It is
/// removed when [`run`](Self::run) returns.
pub struct FileTransfer {
    transport: Arc<dyn TopicTransport>,
    rx: broadcast::Receiver<Message>,
    topics: TransferTopics,
    inbound: Vec<String>,
    outbound: Bytes,
    cursor: usize,
    received: BytesMut,
    mode: Option<TransferMode>,
    idle_timeout: Duration,
}

impl FileTransfer {
    /// Replace the per-message idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn mode(&self) -> Option<TransferMode> {
        self.mode
    }

    /// Drive the transfer until `done` or `timeout`
    ///
    /// Resolves with the accumulated bytes of a download, or the part of the
    /// outbound buffer the device has not requested for an upload.
    #[instrument(skip(self), fields(prefix = %self.topics.prefix))]
    pub async fn run(mut self) -> ApiResult<Bytes> {
        let data = self.topics.data();
        let receive = self.topics.receive();
        let done = self.topics.done();

        loop {
            let msg = next_on_any(&mut self.rx, &self.inbound, self.idle_timeout).await?;

            if msg.topic == data {
                self.mode.get_or_insert(TransferMode::Download);
                self.transport
                    .write(&self.topics.data_reply(), &[])
                    .await?;
                self.received.extend_from_slice(&msg.payload);
                trace!(total = self.received.len(), "Chunk received");
            } else if msg.topic == receive {
                self.mode.get_or_insert(TransferMode::Upload);
                let requested = chunk_length(&msg.payload)?;
                let end = self.cursor.saturating_add(requested).min(self.outbound.len());
                let chunk = self.outbound.slice(self.cursor..end);
                self.transport
                    .write(&self.topics.receive_reply(), &chunk)
                    .await?;
                self.cursor = end;
                trace!(sent = self.cursor, total = self.outbound.len(), "Chunk sent");
            } else if msg.topic == done {
                debug!(mode = ?self.mode, "Transfer done");
                return Ok(match self.mode {
                    Some(TransferMode::Download) => self.received.freeze(),
                    _ => self.outbound.slice(self.cursor..),
                });
            } else {
                return Err(ApiError::TransferTimeout);
            }
        }
    }
}

fn chunk_length(header: &[u8]) -> ApiResult<usize> {
    let raw: [u8; 4] = header
        .try_into()
        .map_err(|_| ApiError::TransferHeaderLength)?;
    Ok(u32::from_le_bytes(raw) as usize)
}

impl Api {
    /// Prepare a bulk transfer over `topics`, holding `outbound` for uploads
    ///
    /// The caller is responsible for subscribing to [`TransferTopics::inbound`].
    pub fn file_transfer(&self, outbound: Bytes, topics: &TransferTopics) -> FileTransfer {
        FileTransfer {
            transport: self.transport.clone(),
            rx: self.transport.listen(),
            inbound: topics.inbound(),
            topics: topics.clone(),
            outbound,
            cursor: 0,
            received: BytesMut::new(),
            mode: None,
            idle_timeout: self.config.file_transfer_timeout(),
        }
    }

    /// Upload `data` through a command that the device answers with a bulk transfer
    ///
    /// The command payload is the MessagePack-encoded byte length. Once the
    /// device reports `done`, one status exchange confirms completion.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn async_file_transfer(
        &self,
        command: &str,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> ApiResult<Message> {
        let timeout = timeout.unwrap_or_else(|| self.config.file_transfer_timeout());
        let topics = TransferTopics::default();
        let inbound = topics.inbound();
        let (topics, data) = (&topics, &data);

        self.with_subscribe(&inbound, move || async move {
            let transfer = self
                .file_transfer(data.clone(), topics)
                .with_idle_timeout(timeout);
            let header = codec::encode_message_pack(&Value::from(data.len() as u64))?;
            self.transport.write(command, &header).await?;
            transfer.run().await?;

            let status = Command::new(topics.status(), topics.status_reply());
            let reply = self.send_and_receive(&[], &status, Some(timeout)).await?;
            let decoded = codec::decode_message_pack(&reply.payload)?;
            check_status(command, decoded.as_ref())?;
            Ok(reply)
        })
        .await
    }

    /// Run a command whose result the device pushes back as a bulk transfer
    #[instrument(skip(self, payload))]
    pub async fn bulk_read(&self, command: &str, payload: &[u8]) -> ApiResult<Bytes> {
        let topics = TransferTopics::default();
        let inbound = topics.inbound();
        let topics = &topics;

        self.with_subscribe(&inbound, move || async move {
            let transfer = self.file_transfer(Bytes::new(), topics);
            self.transport.write(command, payload).await?;
            transfer.run().await
        })
        .await
    }
}
