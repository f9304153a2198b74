//! Mock transport adapter for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{Message, TopicTransport, TransportError};

type Responder = Box<dyn Fn(&[u8]) -> Result<Vec<Message>, TransportError> + Send + Sync>;

/// Subscription bookkeeping entry recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe(String),
    Unsubscribe(String),
}

/// Mock transport adapter for testing
///
/// Replies are scripted per written topic: when a payload is written to a
/// topic with a registered responder, the responder's messages are published
/// to every listener before `write` returns.
pub struct MockTransport {
    closed: AtomicBool,
    incoming_tx: broadcast::Sender<Message>,
    responders: RwLock<HashMap<String, Responder>>,
    writes: RwLock<Vec<Message>>,
    subscription_log: RwLock<Vec<SubscriptionOp>>,
    failing_writes: RwLock<HashMap<String, String>>,
    failing_subscribes: RwLock<HashSet<String>>,
    failing_unsubscribes: RwLock<HashSet<String>>,
    clears: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (incoming_tx, _) = broadcast::channel(capacity);
        Self {
            closed: AtomicBool::new(false),
            incoming_tx,
            responders: RwLock::new(HashMap::new()),
            writes: RwLock::new(Vec::new()),
            subscription_log: RwLock::new(Vec::new()),
            failing_writes: RwLock::new(HashMap::new()),
            failing_subscribes: RwLock::new(HashSet::new()),
            failing_unsubscribes: RwLock::new(HashSet::new()),
            clears: AtomicUsize::new(0),
        }
    }

    /// Register a responder invoked for every write to `topic`
    pub fn on_write<F>(&self, topic: &str, responder: F)
    where
        F: Fn(&[u8]) -> Result<Vec<Message>, TransportError> + Send + Sync + 'static,
    {
        self.responders
            .write()
            .insert(topic.to_string(), Box::new(responder));
    }

    /// Reply to every write on `topic` with a fixed payload on `reply_topic`
    pub fn reply(&self, topic: &str, reply_topic: &str, payload: impl Into<Bytes>) {
        let reply_topic = reply_topic.to_string();
        let payload = payload.into();
        self.on_write(topic, move |_| {
            Ok(vec![Message::new(reply_topic.clone(), payload.clone())])
        });
    }

    /// Remove the responder for `topic`; writes to it are then silently accepted
    pub fn remove_responder(&self, topic: &str) {
        self.responders.write().remove(topic);
    }

    /// Reject every write to `topic` with [`TransportError::WriteFailed`]
    pub fn fail_writes(&self, topic: &str, reason: &str) {
        self.failing_writes
            .write()
            .insert(topic.to_string(), reason.to_string());
    }

    /// Reject subscribing to `topic`
    pub fn fail_subscribe(&self, topic: &str) {
        self.failing_subscribes.write().insert(topic.to_string());
    }

    /// Reject unsubscribing from `topic`; the subscription stays active
    pub fn fail_unsubscribe(&self, topic: &str) {
        self.failing_unsubscribes.write().insert(topic.to_string());
    }

    /// Inject an incoming message (simulates the device publishing a topic)
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let _ = self.incoming_tx.send(Message::new(topic, payload));
    }

    /// Every write seen so far, in order
    pub fn writes(&self) -> Vec<Message> {
        self.writes.read().clone()
    }

    /// Writes seen on a single topic, in order
    pub fn writes_to(&self, topic: &str) -> Vec<Message> {
        self.writes
            .read()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Subscribe/unsubscribe calls in the order they happened
    pub fn subscription_log(&self) -> Vec<SubscriptionOp> {
        self.subscription_log.read().clone()
    }

    /// Topics currently subscribed (subscribe count minus unsubscribe count)
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut active: Vec<String> = Vec::new();
        for op in self.subscription_log.read().iter() {
            match op {
                SubscriptionOp::Subscribe(topic) => active.push(topic.clone()),
                SubscriptionOp::Unsubscribe(topic) => {
                    if let Some(pos) = active.iter().rposition(|t| t == topic) {
                        active.remove(pos);
                    }
                }
            }
        }
        active
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Number of live listeners registered through [`TopicTransport::listen`]
    pub fn listener_count(&self) -> usize {
        self.incoming_tx.receiver_count()
    }
}

#[async_trait]
impl TopicTransport for MockTransport {
    async fn write(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(reason) = self.failing_writes.read().get(topic) {
            return Err(TransportError::WriteFailed {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }

        self.writes
            .write()
            .push(Message::new(topic, Bytes::copy_from_slice(payload)));
        tracing::debug!(topic, len = payload.len(), "Mock transport: write");

        let replies = match self.responders.read().get(topic) {
            Some(responder) => responder(payload)?,
            None => Vec::new(),
        };
        for reply in replies {
            let _ = self.incoming_tx.send(reply);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.failing_subscribes.read().contains(topic) {
            return Err(TransportError::SubscribeFailed(topic.to_string()));
        }
        self.subscription_log
            .write()
            .push(SubscriptionOp::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.failing_unsubscribes.read().contains(topic) {
            return Err(TransportError::UnsubscribeFailed(topic.to_string()));
        }
        self.subscription_log
            .write()
            .push(SubscriptionOp::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn listen(&self) -> broadcast::Receiver<Message> {
        self.incoming_tx.subscribe()
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
