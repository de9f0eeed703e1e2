//! Wire messages
//!
//! Requests are `{id, deviceId, method, params}`. Responses carry the same
//! `id` and exactly one of `result` or `error: {code, message}`.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtocolError, TransportError};
use crate::registry::RpcMethod;

/// Error codes carried in `error.code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Message shape is wrong
    InvalidRequest,
    /// Method is not supported by the device
    MethodNotFound,
    /// Params do not match the method
    InvalidParams,
    /// Device failed unexpectedly
    Internal,
    /// Device-side timeout
    Timeout,
    /// Device cannot serve the request right now
    DeviceUnavailable,
    /// Command ran and failed
    ExecutionError,
}

impl ErrorCode {
    /// Numeric wire value
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::Internal => -32603,
            ErrorCode::Timeout => -32000,
            ErrorCode::DeviceUnavailable => -32001,
            ErrorCode::ExecutionError => -32002,
        }
    }

    /// Known code for a wire value
    pub fn from_code(code: i32) -> Option<Self> {
        [
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::Internal,
            ErrorCode::Timeout,
            ErrorCode::DeviceUnavailable,
            ErrorCode::ExecutionError,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Correlation id, a UUID v4 string
    pub id: String,
    /// Target device
    pub device_id: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Request with a fresh correlation id
    pub fn new(device_id: impl Into<String>, method: RpcMethod, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            method: method.as_str().to_string(),
            params,
        }
    }

    /// JSON payload
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Encode(e.to_string()))
    }
}

/// The `error` member of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric code, see [`ErrorCode`]
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Extra details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    /// Error body with a known code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Known code, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// Result or error
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Command succeeded
    Result(Value),
    /// Command failed on the device
    Error(RpcErrorBody),
}

/// A device's answer to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct RpcResponse {
    /// Correlation id of the request being answered
    pub id: String,
    /// Outcome
    pub body: ResponseBody,
}

impl RpcResponse {
    /// Successful response
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Result(result),
        }
    }

    /// Failed response
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Error(RpcErrorBody::new(code, message)),
        }
    }

    /// Whether the device reported success
    pub fn is_ok(&self) -> bool {
        matches!(self.body, ResponseBody::Result(_))
    }

    /// Result value, if successful
    pub fn result_value(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Result(value) => Some(value),
            ResponseBody::Error(_) => None,
        }
    }

    /// Error body, if failed
    pub fn error_body(&self) -> Option<&RpcErrorBody> {
        match &self.body {
            ResponseBody::Error(err) => Some(err),
            ResponseBody::Result(_) => None,
        }
    }

    /// JSON payload
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Encode(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    id: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

/// Distinguishes `"result": null` from a missing `result`
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for RpcResponse {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let body = match (raw.result, raw.error) {
            (_, Some(error)) => ResponseBody::Error(error),
            (Some(result), None) => ResponseBody::Result(result),
            (None, None) => return Err("response has neither result nor error".to_string()),
        };
        Ok(Self { id: raw.id, body })
    }
}

impl From<RpcResponse> for RawResponse {
    fn from(response: RpcResponse) -> Self {
        let (result, error) = match response.body {
            ResponseBody::Result(value) => (Some(value), None),
            ResponseBody::Error(err) => (None, Some(err)),
        };
        Self {
            id: response.id,
            result,
            error,
        }
    }
}

/// Parse a payload into JSON and pull out its correlation id
fn decode_envelope(payload: &[u8]) -> Result<(String, Value), ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::InvalidJson)?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(ProtocolError::MissingId)?
        .to_string();
    Ok((id, value))
}

/// Decode a response payload
pub fn decode_response(payload: &[u8]) -> Result<RpcResponse, ProtocolError> {
    let (id, value) = decode_envelope(payload)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidShape {
        id,
        reason: e.to_string(),
    })
}

/// Decode a request payload
pub fn decode_request(payload: &[u8]) -> Result<RpcRequest, ProtocolError> {
    let (id, value) = decode_envelope(payload)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidShape {
        id,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_and_fresh_ids() {
        let a = RpcRequest::new("dev-1", RpcMethod::GetSensors, json!({}));
        let b = RpcRequest::new("dev-1", RpcMethod::GetSensors, json!({}));
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());

        let json = serde_json::to_value(&a).expect("serialization should succeed");
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["method"], "getSensors");
    }

    #[test]
    fn response_wire_shapes() {
        let ok = RpcResponse::result("r1", json!({"temperature": 21.3}));
        assert_eq!(
            serde_json::to_value(&ok).expect("serialization should succeed"),
            json!({"id": "r1", "result": {"temperature": 21.3}})
        );

        let err = RpcResponse::error("r2", ErrorCode::MethodNotFound, "no such method");
        assert_eq!(
            serde_json::to_value(&err).expect("serialization should succeed"),
            json!({"id": "r2", "error": {"code": -32601, "message": "no such method"}})
        );
    }

    #[test]
    fn null_result_is_a_result() {
        let decoded =
            decode_response(br#"{"id":"r1","result":null}"#).expect("null result should decode");
        assert_eq!(decoded.body, ResponseBody::Result(Value::Null));
    }

    #[test]
    fn error_wins_over_result() {
        let decoded = decode_response(
            br#"{"id":"r1","result":1,"error":{"code":-32002,"message":"boom"}}"#,
        )
        .expect("response should decode");
        assert_eq!(
            decoded.error_body().and_then(RpcErrorBody::error_code),
            Some(ErrorCode::ExecutionError)
        );
    }

    #[test]
    fn decode_failures_are_classified() {
        assert!(matches!(
            decode_response(b"not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_response(br#"{"result":1}"#),
            Err(ProtocolError::MissingId)
        ));
        assert!(matches!(
            decode_response(br#"{"id":7,"result":1}"#),
            Err(ProtocolError::MissingId)
        ));

        let err = decode_response(br#"{"id":"r1"}"#).expect_err("bodyless response must fail");
        assert_eq!(err.request_id(), Some("r1"));

        let err = decode_request(br#"{"id":"r2","method":"getSensors"}"#)
            .expect_err("request without deviceId must fail");
        assert_eq!(err.request_id(), Some("r2"));
    }

    #[test]
    fn error_codes_round_trip_through_numbers() {
        for code in [-32600, -32601, -32602, -32603, -32000, -32001, -32002] {
            let known = ErrorCode::from_code(code).expect("code should be known");
            assert_eq!(known.code(), code);
        }
        assert_eq!(ErrorCode::from_code(1), None);
    }
}
