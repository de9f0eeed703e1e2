//! Common utilities for iothub: identifiers, telemetry, and retry policy

#![deny(missing_docs)]

pub mod ids;
pub mod retry;
pub mod telemetry;

pub use ids::{validate_identifier, IdentifierError};
pub use retry::{retry_with_backoff, Backoff, RetryConfig};

/// Plain-TCP MQTT port advertised to devices
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// mTLS MQTT port advertised to devices
pub const DEFAULT_MQTT_SECURE_PORT: u16 = 8883;

/// Default broker URL advertised in CSR responses
pub const DEFAULT_BROKER_URL: &str = "mqtts://localhost";

/// Directory holding the root CA key and certificate
pub const DEFAULT_CA_DIR: &str = "certs";
