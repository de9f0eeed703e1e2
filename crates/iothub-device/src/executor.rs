//! Device-side request loop
//!
//! [`DeviceCommandExecutor`] listens on the device's request topic and answers
//! every request that carries a correlation id with exactly one response on
//! the response topic. Validation failures, handler errors and handler panics
//! all become error responses; only payloads with no usable id are dropped,
//! since there is nothing to correlate an answer with.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use iothub_common::{validate_identifier, IdentifierError};
use iothub_rpc::protocol::decode_request;
use iothub_rpc::topics::{request_topic, response_topic, status_topic};
use iothub_rpc::{
    BrokerLink, ErrorCode, InboundMessage, ProtocolError, RpcMethodRegistry, RpcRequest,
    RpcResponse, TransportError, ValidationError,
};

use crate::handler::CommandHandler;

/// Errors starting the executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// User or device id is not usable in a topic
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// Broker operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Payload published on the status topic
pub fn status_payload(online: bool) -> Bytes {
    let status = if online { "online" } else { "offline" };
    Bytes::from(json!({ "status": status }).to_string())
}

/// Answers RPC requests addressed to one device
pub struct DeviceCommandExecutor {
    link: Arc<dyn BrokerLink>,
    user_id: String,
    device_id: String,
    registry: RpcMethodRegistry,
    handler: Arc<dyn CommandHandler>,
}

impl DeviceCommandExecutor {
    /// Executor for `device_id` owned by `user_id`
    pub fn new(
        link: Arc<dyn BrokerLink>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, ExecutorError> {
        let user_id = user_id.into();
        let device_id = device_id.into();
        validate_identifier("user id", &user_id)?;
        validate_identifier("device id", &device_id)?;
        Ok(Self {
            link,
            user_id,
            device_id,
            registry: RpcMethodRegistry::default(),
            handler,
        })
    }

    /// Restrict the methods this device serves
    pub fn with_registry(mut self, registry: RpcMethodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Device id requests must be addressed to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Subscribe, announce the device online and serve requests in the
    /// background until `inbound` closes.
    pub async fn start(
        self,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        let topic = request_topic(&self.user_id, &self.device_id);
        self.link.subscribe(&topic).await?;

        let status = status_topic(&self.user_id, &self.device_id);
        if let Err(e) = self.link.publish(&status, status_payload(true)).await {
            warn!(topic = %status, error = %e, "Failed to announce device online");
        }

        info!(
            user_id = %self.user_id,
            device_id = %self.device_id,
            topic = %topic,
            "Device command executor started"
        );
        Ok(tokio::spawn(Arc::new(self).serve(inbound)))
    }

    async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            // Requests run concurrently; a slow command must not hold up others
            let this = self.clone();
            tokio::spawn(async move { this.process(message).await });
        }
        debug!(device_id = %self.device_id, "Inbound stream closed, executor stopped");
    }

    async fn process(&self, message: InboundMessage) {
        let response = match decode_request(&message.payload) {
            Ok(request) => self.execute(request).await,
            Err(ProtocolError::InvalidShape { id, reason }) => {
                warn!(request_id = %id, reason = %reason, "Malformed request");
                RpcResponse::error(id, ErrorCode::InvalidRequest, reason)
            }
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping request without correlation id");
                return;
            }
        };

        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(request_id = %response.id, error = %e, "Failed to encode response");
                return;
            }
        };
        let topic = response_topic(&self.user_id, &self.device_id);
        if let Err(e) = self.link.publish(&topic, payload).await {
            error!(request_id = %response.id, error = %e, "Failed to publish response");
        }
    }

    /// Produce the single response for `request`
    pub async fn execute(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            id,
            device_id,
            method,
            params,
        } = request;

        if device_id != self.device_id {
            warn!(request_id = %id, target = %device_id, "Request addressed to another device");
            return RpcResponse::error(
                id,
                ErrorCode::InvalidParams,
                format!("request is addressed to {device_id}, not {}", self.device_id),
            );
        }

        let call = match self.registry.resolve(&method, params) {
            Ok(call) => call,
            Err(e) => {
                let code = match e {
                    ValidationError::UnknownMethod(_) => ErrorCode::MethodNotFound,
                    _ => ErrorCode::InvalidParams,
                };
                debug!(request_id = %id, method = %method, error = %e, "Rejected request");
                return RpcResponse::error(id, code, e.to_string());
            }
        };

        debug!(request_id = %id, method = %method, "Executing command");
        let handler = self.handler.clone();
        match tokio::spawn(async move { handler.handle(call).await }).await {
            Ok(Ok(result)) => RpcResponse::result(id, result),
            Ok(Err(e)) => {
                warn!(request_id = %id, method = %method, error = %e, "Command failed");
                RpcResponse::error(id, e.code(), e.to_string())
            }
            Err(join) => {
                error!(request_id = %id, method = %method, error = %join, "Command handler aborted");
                RpcResponse::error(id, ErrorCode::Internal, "internal error")
            }
        }
    }
}
