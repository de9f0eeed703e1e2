//! RPC error taxonomy
//!
//! Callers of the transport see [`RpcError`]. Validation and transport
//! failures come back before any correlator state exists; a timeout is the
//! only failure that is decided after a request left the process.

use std::time::Duration;

use iothub_common::IdentifierError;
use thiserror::Error;

/// A request was rejected before anything was sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A user or device id is not acceptable
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// Method name is not in the registry
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Params do not match the method's shape
    #[error("invalid params for {method}: {reason}")]
    InvalidParams {
        /// Method being called
        method: String,
        /// What was wrong
        reason: String,
    },

    /// Timeout outside `(0, max]`
    #[error("timeout must be greater than zero and at most {max:?}, got {requested:?}")]
    InvalidTimeout {
        /// Timeout the caller asked for
        requested: Duration,
        /// Configured upper bound
        max: Duration,
    },
}

/// Broker link failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Link is down
    #[error("broker link is not connected")]
    NotConnected,

    /// Link did not come up in time
    #[error("broker connection not established within {0:?}")]
    ConnectTimeout(Duration),

    /// Subscription request failed
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Topic filter
        topic: String,
        /// Client error
        reason: String,
    },

    /// Publish request failed
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Target topic
        topic: String,
        /// Client error
        reason: String,
    },

    /// Request could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// Link configuration is unusable
    #[error("invalid broker configuration: {0}")]
    Config(String),

    /// Link was shut down
    #[error("broker link closed")]
    Closed,
}

/// A message that does not follow the wire protocol.
///
/// Never returned to RPC callers; the dispatch loop logs it and moves on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is not JSON
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Payload carries no usable correlation id
    #[error("payload has no correlation id")]
    MissingId,

    /// Payload has an id but the wrong shape
    #[error("message {id} is malformed: {reason}")]
    InvalidShape {
        /// Correlation id of the message
        id: String,
        /// What was wrong
        reason: String,
    },
}

impl ProtocolError {
    /// Correlation id, if the payload had one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ProtocolError::InvalidShape { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Outcome of a failed RPC call
#[derive(Debug, Error)]
pub enum RpcError {
    /// Rejected locally, nothing was sent
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Transport is not connected and subscribed
    #[error("RPC transport is not ready")]
    NotReady,

    /// Broker link failed while sending
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No response within the deadline
    #[error("{method} on {device_id} timed out after {timeout:?} (request {request_id})")]
    Timeout {
        /// Correlation id
        request_id: String,
        /// Target device
        device_id: String,
        /// Method called
        method: String,
        /// Deadline that elapsed
        timeout: Duration,
    },
}

impl RpcError {
    /// Whether sending the same request again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Validation(_) => false,
            RpcError::NotReady | RpcError::Transport(_) | RpcError::Timeout { .. } => true,
        }
    }
}

/// Result type for RPC operations
pub type Result<T, E = RpcError> = std::result::Result<T, E>;
