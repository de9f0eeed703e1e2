//! Broker connection seam
//!
//! A [`BrokerLink`] is one client session on a pub/sub broker. Inbound
//! publishes are not part of the trait; every link constructor hands back an
//! `mpsc::Receiver<InboundMessage>` alongside the link, and the owner drains it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Capacity of the inbound message channel
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic it was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// One client session on a broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Wait until the session is up, at most `timeout`
    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Whether the session is currently up
    fn is_connected(&self) -> bool;

    /// Subscribe to a topic filter at QoS 1.
    ///
    /// Links re-establish their subscriptions after a reconnect.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish at QoS 1, not retained
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}
