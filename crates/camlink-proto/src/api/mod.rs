//! Protocol client
//!
//! [`Api`] owns the shared transport handle. Every exchange that expects a
//! reply clears stale input, subscribes to the reply topic, registers a
//! listener, writes the command and waits for the first message on the
//! reply topic.

mod info;
mod transfer;

pub use transfer::{FileTransfer, TransferMode, TransferTopics};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, instrument, trace, warn};

use crate::codec::{self, DecodeKind, Decoded};
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::locksmith::Locksmith;
use crate::topics;
use crate::transport::{Message, TopicTransport, TransportError};

/// A named command and the topic its reply arrives on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub send: String,
    pub receive: String,
}

impl Command {
    pub fn new(send: impl Into<String>, receive: impl Into<String>) -> Self {
        Self {
            send: send.into(),
            receive: receive.into(),
        }
    }

    /// Command whose reply arrives on `<send>_reply`
    pub fn with_reply(send: impl Into<String>) -> Self {
        let send = send.into();
        let receive = topics::reply(&send);
        Self { send, receive }
    }
}

/// Result of a one-time capability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

/// How product info is read and written on this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProductInfoMode {
    #[default]
    Unknown,
    /// Single round trip on `prodinfo/*_msgpack`
    Structured,
    /// Bulk transfer on `prodinfo/get` / `prodinfo/set`
    Legacy,
}

/// Protocol client bound to one device transport
pub struct Api {
    transport: Arc<dyn TopicTransport>,
    config: ApiConfig,
    locksmith: Locksmith,
    write_buf: RwLock<Capability>,
    prodinfo_mode: RwLock<ProductInfoMode>,
}

impl Api {
    pub fn new(transport: Arc<dyn TopicTransport>, config: ApiConfig) -> Self {
        Self {
            transport,
            config,
            locksmith: Locksmith::new(),
            write_buf: RwLock::new(Capability::Unknown),
            prodinfo_mode: RwLock::new(ProductInfoMode::Unknown),
        }
    }

    pub fn transport(&self) -> &Arc<dyn TopicTransport> {
        &self.transport
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn locksmith(&self) -> &Locksmith {
        &self.locksmith
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Close the underlying transport
    pub async fn close(&self) -> ApiResult<()> {
        self.transport.close().await?;
        Ok(())
    }

    // =========================================================================
    // Capability cache
    // =========================================================================

    /// Cached `upgrader/write_buf` support
    pub fn write_buf_capability(&self) -> Capability {
        *self.write_buf.read()
    }

    pub fn set_write_buf_capability(&self, capability: Capability) {
        *self.write_buf.write() = capability;
    }

    pub fn product_info_mode(&self) -> ProductInfoMode {
        *self.prodinfo_mode.read()
    }

    fn set_product_info_mode(&self, mode: ProductInfoMode) {
        *self.prodinfo_mode.write() = mode;
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode a payload; raw binary passes through, anything else is MessagePack
    pub fn encode(value: &Value) -> ApiResult<Bytes> {
        codec::encode(value)
    }

    /// Decode a reply body; `kind` is one of `string`, `int`, `double`, `messagepack`
    pub fn decode(bytes: &[u8], kind: &str) -> ApiResult<Decoded> {
        let kind: DecodeKind = kind.parse()?;
        codec::decode(bytes, kind)
    }

    // =========================================================================
    // Command / reply
    // =========================================================================

    /// Write a payload without waiting for a reply
    pub async fn write(&self, topic: &str, payload: &[u8]) -> ApiResult<()> {
        self.transport.write(topic, payload).await?;
        Ok(())
    }

    /// Register a listener for every incoming message
    pub fn listen(&self) -> broadcast::Receiver<Message> {
        self.transport.listen()
    }

    /// Send `payload` on `command.send` and wait for the first message on `command.receive`
    ///
    /// `timeout` defaults to [`ApiConfig::default_timeout_ms`]. The reply
    /// topic is unsubscribed on every path; an unsubscribe failure after a
    /// successful exchange is reported, after a failed one it is only logged.
    #[instrument(skip(self, payload), fields(send = %command.send, receive = %command.receive))]
    pub async fn send_and_receive(
        &self,
        payload: &[u8],
        command: &Command,
        timeout: Option<Duration>,
    ) -> ApiResult<Message> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());

        self.transport.clear().await?;
        self.transport.subscribe(&command.receive).await?;

        let mut rx = self.transport.listen();
        let outcome = async {
            self.transport.write(&command.send, payload).await?;
            next_on_topic(&mut rx, &command.receive, timeout).await
        }
        .await;
        drop(rx);

        let unsubscribed = self.transport.unsubscribe(&command.receive).await;
        match (outcome, unsubscribed) {
            (Ok(reply), Ok(())) => {
                trace!(len = reply.payload.len(), "Reply received");
                Ok(reply)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(unsub_err)) => {
                warn!(error = %unsub_err, "Unsubscribe failed after failed exchange");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// [`send_and_receive`](Self::send_and_receive) serialized through the locksmith
    pub async fn send_and_receive_exclusive(
        &self,
        payload: &[u8],
        command: &Command,
        timeout: Option<Duration>,
    ) -> ApiResult<Message> {
        self.locksmith
            .execute_exclusively(move || async move {
                self.send_and_receive(payload, command, timeout).await
            })
            .await
    }

    /// Exchange MessagePack values; an empty reply is `None`
    pub async fn send_and_receive_message_pack(
        &self,
        value: &Value,
        command: &Command,
        timeout: Option<Duration>,
    ) -> ApiResult<Option<Value>> {
        let payload = codec::encode_message_pack(value)?;
        let reply = self.send_and_receive(&payload, command, timeout).await?;
        codec::decode_message_pack(&reply.payload)
    }

    /// Exchange typed MessagePack structures (maps with named fields)
    pub async fn request<T, R>(
        &self,
        body: &T,
        command: &Command,
        timeout: Option<Duration>,
    ) -> ApiResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = rmp_serde::to_vec_named(body)?;
        let reply = self
            .send_and_receive_exclusive(&payload, command, timeout)
            .await?;
        if reply.payload.is_empty() {
            return Err(ApiError::UnexpectedReply {
                command: command.send.clone(),
                reason: "empty reply".to_string(),
            });
        }
        Ok(rmp_serde::from_slice(&reply.payload)?)
    }

    /// Send a command and wait for its `<cmd>_done` completion
    ///
    /// Messages on `<cmd>_status` are handed to `on_status` as they arrive.
    /// `timeout` bounds each individual wait, so a device that keeps
    /// reporting progress is never cut off.
    #[instrument(skip(self, payload, on_status))]
    pub async fn send_and_wait_done<F>(
        &self,
        command: &str,
        payload: &[u8],
        timeout: Duration,
        mut on_status: F,
    ) -> ApiResult<Message>
    where
        F: FnMut(&Message) + Send,
    {
        let done = topics::done(command);
        let status = topics::status(command);

        self.locksmith
            .execute_exclusively(move || async move {
                let watched = [done.clone(), status.clone()];
                let watched = &watched[..];
                self.with_subscribe(watched, move || async move {
                    let mut rx = self.transport.listen();
                    self.transport.write(command, payload).await?;
                    loop {
                        let msg = next_on_any(&mut rx, watched, timeout).await?;
                        if msg.topic == status {
                            on_status(&msg);
                            continue;
                        }
                        debug!(topic = %done, "Command completed");
                        return Ok(msg);
                    }
                })
                .await
            })
            .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to `topics`, run `work`, then unsubscribe in reverse order
    ///
    /// Cleanup runs whether `work` succeeds or fails. If the returned future
    /// is dropped before completion the unsubscribes are issued from a
    /// detached task instead.
    pub async fn with_subscribe<S, F, Fut, T>(&self, topics: &[S], work: F) -> ApiResult<T>
    where
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut guard = SubscriptionGuard::new(self.transport.clone());

        for topic in topics {
            let topic = topic.as_ref();
            if let Err(e) = self.transport.subscribe(topic).await {
                if let Err(unsub_err) = guard.release().await {
                    warn!(error = %unsub_err, "Unsubscribe failed after failed subscribe");
                }
                return Err(e.into());
            }
            guard.push(topic);
        }

        let outcome = work().await;
        let cleanup = guard.release().await;

        match (outcome, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(unsub_err)) => {
                warn!(error = %unsub_err, "Unsubscribe failed after failed operation");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}

/// Topics subscribed by an in-flight [`Api::with_subscribe`]
struct SubscriptionGuard {
    transport: Arc<dyn TopicTransport>,
    topics: Vec<String>,
}

impl SubscriptionGuard {
    fn new(transport: Arc<dyn TopicTransport>) -> Self {
        Self {
            transport,
            topics: Vec::new(),
        }
    }

    fn push(&mut self, topic: &str) {
        self.topics.push(topic.to_string());
    }

    /// Unsubscribe everything in reverse order; the first error is returned
    async fn release(&mut self) -> Result<(), TransportError> {
        let mut first_error = None;
        while let Some(topic) = self.topics.pop() {
            if let Err(e) = self.transport.unsubscribe(&topic).await {
                warn!(topic = %topic, error = %e, "Unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.topics.is_empty() {
            return;
        }
        let topics = std::mem::take(&mut self.topics);
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for topic in topics.iter().rev() {
                        let _ = transport.unsubscribe(topic).await;
                    }
                });
            }
            Err(_) => warn!(count = topics.len(), "Subscriptions leaked outside runtime"),
        }
    }
}

// =============================================================================
// Listener helpers
// =============================================================================

/// Wait for the next message on `topic`, skipping everything else
pub async fn next_on_topic(
    rx: &mut broadcast::Receiver<Message>,
    topic: &str,
    timeout: Duration,
) -> ApiResult<Message> {
    next_matching(rx, |t| t == topic, topic, timeout).await
}

/// Wait for the next message on any of `topics`
pub async fn next_on_any<S: AsRef<str>>(
    rx: &mut broadcast::Receiver<Message>,
    topics: &[S],
    timeout: Duration,
) -> ApiResult<Message> {
    let label = topics
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join("|");
    next_matching(rx, |t| topics.iter().any(|w| w.as_ref() == t), &label, timeout).await
}

async fn next_matching<P>(
    rx: &mut broadcast::Receiver<Message>,
    matches: P,
    label: &str,
    timeout: Duration,
) -> ApiResult<Message>
where
    P: Fn(&str) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(msg) if matches(&msg.topic) => return Ok(msg),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Listener lagged, messages dropped");
                }
                Err(RecvError::Closed) => return Err(TransportError::ConnectionClosed.into()),
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ApiError::Timeout {
            topic: label.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

/// Reject a structured reply that carries a non-zero `status`
pub fn check_status(command: &str, reply: Option<&Value>) -> ApiResult<()> {
    let code = reply
        .and_then(|v| codec::map_get(v, "status"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if code != 0 {
        return Err(ApiError::DeviceStatus {
            command: command.to_string(),
            code,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, SubscriptionOp};

    fn api_with(transport: Arc<MockTransport>) -> Api {
        Api::new(transport, ApiConfig::default())
    }

    #[tokio::test]
    async fn test_send_and_receive_subscribes_and_cleans_up() {
        let transport = Arc::new(MockTransport::new());
        transport.reply("camctrl/uptime", "camctrl/uptime_reply", vec![9]);
        let api = api_with(transport.clone());

        let reply = api
            .send_and_receive(&[], &Command::with_reply("camctrl/uptime"), None)
            .await
            .unwrap();

        assert_eq!(reply.topic, "camctrl/uptime_reply");
        assert_eq!(&reply.payload[..], &[9]);
        assert_eq!(transport.clear_count(), 1);
        assert_eq!(
            transport.subscription_log(),
            vec![
                SubscriptionOp::Subscribe("camctrl/uptime_reply".into()),
                SubscriptionOp::Unsubscribe("camctrl/uptime_reply".into()),
            ]
        );
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive_times_out() {
        let transport = Arc::new(MockTransport::new());
        let api = api_with(transport.clone());

        let err = api
            .send_and_receive(&[1], &Command::with_reply("silent"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Timeout { timeout_ms: 500, .. }));
        assert!(transport.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_other_topics() {
        let transport = Arc::new(MockTransport::new());
        transport.on_write("a", |_| {
            Ok(vec![
                Message::new("noise", vec![0]),
                Message::new("a_reply", vec![1]),
            ])
        });
        let api = api_with(transport);

        let reply = api
            .send_and_receive(&[], &Command::with_reply("a"), None)
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], &[1]);
    }

    #[tokio::test]
    async fn test_with_subscribe_reverse_cleanup_on_error() {
        let transport = Arc::new(MockTransport::new());
        let api = api_with(transport.clone());

        let result: ApiResult<()> = api
            .with_subscribe(&["one", "two"], || async {
                Err(ApiError::TransferTimeout)
            })
            .await;

        assert!(matches!(result, Err(ApiError::TransferTimeout)));
        assert_eq!(
            transport.subscription_log(),
            vec![
                SubscriptionOp::Subscribe("one".into()),
                SubscriptionOp::Subscribe("two".into()),
                SubscriptionOp::Unsubscribe("two".into()),
                SubscriptionOp::Unsubscribe("one".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_with_subscribe_unwinds_when_subscribe_fails() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscribe("two");
        let api = api_with(transport.clone());

        let result: ApiResult<()> = api
            .with_subscribe(&["one", "two", "three"], || async { Ok(()) })
            .await;

        assert!(matches!(
            result,
            Err(ApiError::Transport(TransportError::SubscribeFailed(ref t))) if t == "two"
        ));
        assert_eq!(
            transport.subscription_log(),
            vec![
                SubscriptionOp::Subscribe("one".into()),
                SubscriptionOp::Unsubscribe("one".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_with_subscribe_reports_cleanup_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_unsubscribe("one");
        let api = api_with(transport.clone());

        let result = api
            .with_subscribe(&["one", "two"], || async { Ok(7) })
            .await;
        assert!(matches!(
            result,
            Err(ApiError::Transport(TransportError::UnsubscribeFailed(ref t))) if t == "one"
        ));
        // The other topic is still released
        assert_eq!(transport.active_subscriptions(), vec!["one".to_string()]);

        // A failing operation keeps its own error
        let result: ApiResult<()> = api
            .with_subscribe(&["one"], || async { Err(ApiError::TransferTimeout) })
            .await;
        assert!(matches!(result, Err(ApiError::TransferTimeout)));
    }

    #[tokio::test]
    async fn test_with_subscribe_cleans_up_when_cancelled() {
        let transport = Arc::new(MockTransport::new());
        let api = api_with(transport.clone());

        let pending = api.with_subscribe(&["never"], || std::future::pending::<ApiResult<()>>());
        let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(outcome.is_err());

        // Detached cleanup task
        tokio::task::yield_now().await;
        assert!(transport.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_wait_done_reports_status() {
        let transport = Arc::new(MockTransport::new());
        transport.on_write("upgrader/erase_flash", |_| {
            Ok(vec![
                Message::new("upgrader/erase_flash_status", vec![1]),
                Message::new("upgrader/erase_flash_status", vec![2]),
                Message::new("upgrader/erase_flash_done", vec![0]),
            ])
        });
        let api = api_with(transport.clone());

        let mut seen = Vec::new();
        let done = api
            .send_and_wait_done("upgrader/erase_flash", &[], Duration::from_secs(1), |m| {
                seen.push(m.payload[0])
            })
            .await
            .unwrap();

        assert_eq!(done.topic, "upgrader/erase_flash_done");
        assert_eq!(seen, vec![1, 2]);
        assert!(transport.active_subscriptions().is_empty());
    }

    #[test]
    fn test_check_status() {
        let ok = Value::Map(vec![(Value::from("status"), Value::from(0))]);
        let bad = Value::Map(vec![(Value::from("status"), Value::from(-3))]);
        assert!(check_status("x", Some(&ok)).is_ok());
        assert!(check_status("x", None).is_ok());
        assert!(matches!(
            check_status("x", Some(&bad)),
            Err(ApiError::DeviceStatus { code: -3, .. })
        ));
    }

    #[test]
    fn test_static_decode_rejects_unknown_kind() {
        assert!(matches!(
            Api::decode(&[], "bool"),
            Err(ApiError::UnsupportedDecodeType(_))
        ));
    }
}
