//! In-process broker
//!
//! Routes publishes between [`MemoryLink`]s with MQTT wildcard matching. Used
//! for tests and for running the hub and a simulated device in one process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::link::{BrokerLink, InboundMessage, INBOUND_CHANNEL_CAPACITY};
use crate::topics::topic_matches;

struct Subscription {
    link_id: u64,
    filter: String,
    online: watch::Receiver<bool>,
    tx: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<Vec<Subscription>>,
    history: Mutex<Vec<InboundMessage>>,
    next_link_id: AtomicU64,
}

/// Shared in-memory broker; clones refer to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. The link starts connected.
    pub fn connect(&self, client_id: &str) -> (MemoryLink, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (online, _) = watch::channel(true);
        let id = self.state.next_link_id.fetch_add(1, Ordering::Relaxed);
        debug!(client_id = %client_id, link_id = id, "Memory broker session opened");

        let link = MemoryLink {
            broker: self.clone(),
            id,
            client_id: client_id.to_string(),
            tx,
            online,
            fail_publishes: AtomicBool::new(false),
        };
        (link, rx)
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state.history.lock().clone()
    }

    async fn route(&self, message: InboundMessage) -> usize {
        self.state.history.lock().push(message.clone());

        // Collect targets first; never hold the lock across a send
        let targets: Vec<_> = {
            let mut subs = self.state.subscriptions.lock();
            subs.retain(|s| !s.tx.is_closed());
            let mut seen = HashSet::new();
            subs.iter()
                .filter(|s| *s.online.borrow() && topic_matches(&s.filter, &message.topic))
                .filter(|s| seen.insert(s.link_id))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        trace!(topic = %message.topic, delivered, "Routed message");
        delivered
    }
}

/// A session on a [`MemoryBroker`]
pub struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
    client_id: String,
    tx: mpsc::Sender<InboundMessage>,
    online: watch::Sender<bool>,
    fail_publishes: AtomicBool,
}

impl MemoryLink {
    /// Client id given at connect
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Simulate the session dropping or coming back
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    /// Make every publish fail while set
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.online.subscribe();
        let res = match tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        };
        res
    }

    fn is_connected(&self) -> bool {
        *self.online.borrow()
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.broker.state.subscriptions.lock().push(Subscription {
            link_id: self.id,
            filter: filter.to_string(),
            online: self.online.subscribe(),
            tx: self.tx.clone(),
        });
        debug!(client_id = %self.client_id, filter = %filter, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publishes.load(Ordering::Relaxed) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "publish rejected".to_string(),
            });
        }
        self.broker
            .route(InboundMessage {
                topic: topic.to_string(),
                payload,
            })
            .await;
        Ok(())
    }
}
