//! RPC over MQTT for iothub
//!
//! The hub publishes a request on a device's request topic and the device
//! answers on its response topic with the same correlation id. This crate
//! holds both sides' shared pieces: topic layout, wire messages, the method
//! catalogue, and broker links. It also holds the hub side itself: the
//! pending-call table and [`RpcTransport`].
//!
//! Broker links:
//! - [`MqttLink`]: `rumqttc` session with mTLS, reconnect and re-subscribe
//! - [`MemoryBroker`]: in-process broker for tests and local runs

#![deny(missing_docs)]

pub mod correlator;
pub mod error;
pub mod link;
pub mod memory;
pub mod mqtt;
pub mod protocol;
pub mod registry;
pub mod topics;
pub mod transport;

pub use correlator::{DispatchError, PendingReply, RpcCorrelator, Settlement};
pub use error::{ProtocolError, RpcError, TransportError, ValidationError};
pub use link::{BrokerLink, InboundMessage};
pub use memory::{MemoryBroker, MemoryLink};
pub use mqtt::{MqttConfig, MqttLink, MqttTls};
pub use protocol::{ErrorCode, ResponseBody, RpcErrorBody, RpcRequest, RpcResponse};
pub use registry::{MethodParams, RpcCall, RpcMethod, RpcMethodRegistry};
pub use transport::{RpcConfig, RpcTransport};
