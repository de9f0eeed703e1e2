//! MQTT broker link on `rumqttc`
//!
//! The event loop runs in a spawned task for the life of the link. It
//! reconnects with jittered exponential backoff, re-issues every recorded
//! subscription after each CONNACK (sessions are clean), and forwards
//! incoming publishes to the link's inbound channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use iothub_common::{RetryConfig, DEFAULT_MQTT_PORT, DEFAULT_MQTT_SECURE_PORT};

use crate::error::TransportError;
use crate::link::{BrokerLink, InboundMessage, INBOUND_CHANNEL_CAPACITY};

/// Default MQTT keep-alive
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Capacity of the client request queue
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Client certificate material for mTLS
#[derive(Clone)]
pub struct MqttTls {
    /// Root CA, PEM
    pub ca_pem: Vec<u8>,
    /// Client certificate, PEM
    pub client_cert_pem: Vec<u8>,
    /// Client private key, PEM
    pub client_key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for MqttTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTls").finish_non_exhaustive()
    }
}

/// Username/password login
#[derive(Clone)]
pub struct MqttCredentials {
    /// Username
    pub username: String,
    /// Password
    pub password: Zeroizing<String>,
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Message the broker publishes if the session dies uncleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttLastWill {
    /// Topic
    pub topic: String,
    /// Payload
    pub payload: Bytes,
    /// Whether the broker retains it
    pub retain: bool,
}

/// Connection settings for [`MqttLink`]
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client id
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Start every session clean
    pub clean_session: bool,
    /// Optional login
    pub credentials: Option<MqttCredentials>,
    /// Optional mTLS material
    pub tls: Option<MqttTls>,
    /// Optional last will
    pub last_will: Option<MqttLastWill>,
    /// Reconnect backoff
    pub reconnect: RetryConfig,
}

impl MqttConfig {
    /// Plain settings for `host:port`
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            credentials: None,
            tls: None,
            last_will: None,
            reconnect: RetryConfig::default(),
        }
    }

    /// Settings from a broker URL such as `mqtts://broker.local:8883`.
    ///
    /// `mqtt://`/`tcp://` default to port 1883, `mqtts://`/`ssl://` to 8883.
    /// A secure scheme still needs [`with_tls`](Self::with_tls).
    pub fn from_url(url: &str, client_id: impl Into<String>) -> Result<Self, TransportError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::Config(format!("broker URL has no scheme: {}", url)))?;
        let default_port = match scheme {
            "mqtt" | "tcp" => DEFAULT_MQTT_PORT,
            "mqtts" | "ssl" => DEFAULT_MQTT_SECURE_PORT,
            other => {
                return Err(TransportError::Config(format!(
                    "unsupported broker scheme: {}",
                    other
                )))
            }
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    TransportError::Config(format!("invalid broker port in {}", url))
                })?;
                (host, port)
            }
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(TransportError::Config(format!("broker URL has no host: {}", url)));
        }

        Ok(Self::new(host, port, client_id))
    }

    /// Use mTLS
    pub fn with_tls(mut self, tls: MqttTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Log in with a username and password
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(MqttCredentials {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        });
        self
    }

    /// Register a last will
    pub fn with_last_will(mut self, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.last_will = Some(MqttLastWill {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        });
        self
    }

    fn options(&self) -> Result<MqttOptions, TransportError> {
        if self.client_id.is_empty() {
            return Err(TransportError::Config("client id is empty".to_string()));
        }
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(self.clean_session);

        if let Some(creds) = &self.credentials {
            options.set_credentials(creds.username.clone(), creds.password.to_string());
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }
        if let Some(tls) = &self.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca_pem.clone(),
                alpn: None,
                client_auth: Some((tls.client_cert_pem.clone(), tls.client_key_pem.to_vec())),
            }));
        }
        Ok(options)
    }
}

/// A live MQTT session
pub struct MqttLink {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    event_loop: JoinHandle<()>,
}

impl MqttLink {
    /// Start the session and its event loop.
    ///
    /// Returns immediately; use [`BrokerLink::wait_connected`] to wait for the
    /// first CONNACK. Must be called from within a tokio runtime.
    pub fn start(
        config: MqttConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), TransportError> {
        let options = config.options()?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            tls = config.tls.is_some(),
            "Starting MQTT link"
        );

        let event_loop = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            connected_tx,
            subscriptions.clone(),
            inbound_tx,
            config.reconnect,
        ));

        Ok((
            Self {
                client,
                connected,
                subscriptions,
                event_loop,
            },
            inbound_rx,
        ))
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.connected.clone();
        let res = match tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        };
        res
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: filter.to_string(),
                reason: e.to_string(),
            })?;

        let mut subs = self.subscriptions.lock();
        if !subs.iter().any(|s| s == filter) {
            subs.push(filter.to_string());
        }
        debug!(filter = %filter, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    connected: watch::Sender<bool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::Sender<InboundMessage>,
    reconnect: RetryConfig,
) {
    let mut backoff = reconnect.backoff();

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "MQTT connected");
                backoff.reset();
                connected.send_replace(true);

                let filters = subscriptions.lock().clone();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        warn!(filter = %filter, error = %e, "Failed to restore subscription");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping MQTT event loop");
                    connected.send_replace(false);
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                connected.send_replace(false);
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    attempt = backoff.attempt(),
                    retry_in_ms = delay.as_millis() as u64,
                    "MQTT connection error, reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mqtt://broker.local", "broker.local", 1883)]
    #[case("tcp://10.0.0.5:1884", "10.0.0.5", 1884)]
    #[case("mqtts://broker.local", "broker.local", 8883)]
    #[case("ssl://broker.local:9883/ignored", "broker.local", 9883)]
    fn parses_broker_urls(#[case] url: &str, #[case] host: &str, #[case] port: u16) {
        let config = MqttConfig::from_url(url, "hub").expect("URL should parse");
        assert_eq!(config.host, host);
        assert_eq!(config.port, port);
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
        assert!(config.clean_session);
    }

    #[rstest]
    #[case("broker.local:1883")]
    #[case("http://broker.local")]
    #[case("mqtt://:1883")]
    #[case("mqtt://broker.local:notaport")]
    fn rejects_bad_broker_urls(#[case] url: &str) {
        assert!(matches!(
            MqttConfig::from_url(url, "hub"),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn empty_client_id_is_rejected() {
        let config = MqttConfig::new("localhost", 1883, "");
        assert!(matches!(config.options(), Err(TransportError::Config(_))));
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let config = MqttConfig::new("localhost", 8883, "dev-1")
            .with_credentials("svc", "hunter2")
            .with_tls(MqttTls {
                ca_pem: b"ca".to_vec(),
                client_cert_pem: b"cert".to_vec(),
                client_key_pem: Zeroizing::new(b"PRIVATE KEY".to_vec()),
            });
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_never_reports_connected() {
        let config = MqttConfig::new("127.0.0.1", 1, "hub");
        let (link, _rx) = MqttLink::start(config).expect("link should start");

        assert!(!link.is_connected());
        assert_eq!(
            link.publish("t", Bytes::new()).await,
            Err(TransportError::NotConnected)
        );
    }
}
