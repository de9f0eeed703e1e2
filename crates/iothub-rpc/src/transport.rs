//! Hub-side RPC transport
//!
//! One [`RpcTransport`] owns one broker link for the whole process. It
//! subscribes once to every device's response topic, and a background task
//! feeds incoming responses to the [`RpcCorrelator`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use iothub_common::validate_identifier;

use crate::correlator::RpcCorrelator;
use crate::error::{Result, RpcError, TransportError, ValidationError};
use crate::link::{BrokerLink, InboundMessage};
use crate::protocol::{decode_response, RpcRequest, RpcResponse};
use crate::registry::{RpcCall, RpcMethodRegistry};
use crate::topics::{parse_response_topic, request_topic, RESPONSE_WILDCARD};

/// Default per-call deadline
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest per-call deadline a caller may ask for
pub const MAX_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for the broker at startup
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Deadline used when the caller gives none
    pub default_timeout: Duration,
    /// Upper bound on caller deadlines
    pub max_timeout: Duration,
    /// Bound on waiting for the broker in [`RpcTransport::connect`]
    pub connect_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_RPC_TIMEOUT,
            max_timeout: MAX_RPC_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Sends commands to devices and waits for their responses
pub struct RpcTransport {
    link: Arc<dyn BrokerLink>,
    correlator: Arc<RpcCorrelator>,
    registry: RpcMethodRegistry,
    config: RpcConfig,
    subscribed: OnceCell<()>,
    dispatcher: JoinHandle<()>,
}

impl RpcTransport {
    /// Wrap a link and start draining its inbound messages.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        link: Arc<dyn BrokerLink>,
        inbound: mpsc::Receiver<InboundMessage>,
        config: RpcConfig,
    ) -> Self {
        let correlator = Arc::new(RpcCorrelator::new());
        let dispatcher = tokio::spawn(dispatch_responses(inbound, correlator.clone()));
        Self {
            link,
            correlator,
            registry: RpcMethodRegistry::default(),
            config,
            subscribed: OnceCell::new(),
            dispatcher,
        }
    }

    /// Restrict the methods this transport will send
    pub fn with_registry(mut self, registry: RpcMethodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Wait for the broker and subscribe to the response wildcard.
    ///
    /// Idempotent; the subscription is issued once per transport.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.link
            .wait_connected(self.config.connect_timeout)
            .await?;
        self.subscribed
            .get_or_try_init(|| async {
                self.link.subscribe(RESPONSE_WILDCARD).await?;
                info!(filter = RESPONSE_WILDCARD, "RPC transport ready");
                Ok::<_, TransportError>(())
            })
            .await?;
        Ok(())
    }

    /// Connected and subscribed
    pub fn is_ready(&self) -> bool {
        self.subscribed.initialized() && self.link.is_connected()
    }

    /// Calls waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Transport timing
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Send a command and wait for the device's answer.
    ///
    /// `timeout` defaults to [`RpcConfig::default_timeout`] and must lie in
    /// `(0, max_timeout]`. A response carrying a device-side error is still
    /// `Ok`; `Err` means the call failed locally, in transit, or timed out.
    #[instrument(skip_all, fields(user_id = %user_id, device_id = %device_id, method = %method))]
    pub async fn send_command_with_response(
        &self,
        user_id: &str,
        device_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse> {
        let timeout = self.resolve_timeout(timeout)?;
        let (call, request) = self.prepare(user_id, device_id, method, params)?;
        self.ensure_ready()?;

        let topic = request_topic(user_id, device_id);
        let payload = request.encode()?;
        let reply =
            self.correlator
                .register(request.id.clone(), device_id, call.method(), timeout);

        debug!(request_id = %request.id, topic = %topic, "Publishing RPC request");
        if let Err(e) = self.link.publish(&topic, payload).await {
            warn!(request_id = %request.id, error = %e, "Failed to publish RPC request");
            self.correlator.fail(&request.id, RpcError::Transport(e));
        }

        reply.wait().await
    }

    /// Send a command without waiting for an answer; returns the request id
    #[instrument(skip_all, fields(user_id = %user_id, device_id = %device_id, method = %method))]
    pub async fn send_command_no_response(
        &self,
        user_id: &str,
        device_id: &str,
        method: &str,
        params: Value,
    ) -> Result<String> {
        let (_, request) = self.prepare(user_id, device_id, method, params)?;
        self.ensure_ready()?;

        let topic = request_topic(user_id, device_id);
        self.link.publish(&topic, request.encode()?).await?;
        debug!(request_id = %request.id, topic = %topic, "Published fire-and-forget request");
        Ok(request.id)
    }

    fn resolve_timeout(&self, timeout: Option<Duration>) -> Result<Duration, ValidationError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if timeout.is_zero() || timeout > self.config.max_timeout {
            return Err(ValidationError::InvalidTimeout {
                requested: timeout,
                max: self.config.max_timeout,
            });
        }
        Ok(timeout)
    }

    fn prepare(
        &self,
        user_id: &str,
        device_id: &str,
        method: &str,
        params: Value,
    ) -> Result<(RpcCall, RpcRequest), ValidationError> {
        validate_identifier("user id", user_id)?;
        validate_identifier("device id", device_id)?;
        let call = self.registry.resolve(method, params)?;
        let request = RpcRequest::new(device_id, call.method(), call.params().clone());
        Ok((call, request))
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(RpcError::NotReady);
        }
        Ok(())
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_responses(
    mut inbound: mpsc::Receiver<InboundMessage>,
    correlator: Arc<RpcCorrelator>,
) {
    while let Some(message) = inbound.recv().await {
        let Some((_, device_id)) = parse_response_topic(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message on non-response topic");
            continue;
        };
        match decode_response(&message.payload) {
            Ok(response) => {
                // Undeliverable responses are logged by the correlator
                let _ = correlator.settle(device_id, response);
            }
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping malformed response");
            }
        }
    }
    debug!("Inbound stream closed, response dispatch stopped");
}
