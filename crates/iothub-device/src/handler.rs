//! Local command handlers

use async_trait::async_trait;
use iothub_rpc::{ErrorCode, RpcCall};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a [`CommandHandler`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The command ran and failed
    #[error("command failed: {0}")]
    Failed(String),

    /// The device cannot run commands right now
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl HandlerError {
    /// Wire code this failure is reported with
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Failed(_) => ErrorCode::ExecutionError,
            HandlerError::Unavailable(_) => ErrorCode::DeviceUnavailable,
        }
    }
}

/// Runs validated calls on the device
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Execute one call and produce its result value
    async fn handle(&self, call: RpcCall) -> Result<Value, HandlerError>;
}
