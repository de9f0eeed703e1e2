//! Device side of iothub RPC
//!
//! [`DeviceCommandExecutor`] serves the device's request topic and guarantees
//! one response per correlated request. What a command actually does is up to
//! the [`CommandHandler`] it is given; [`SimulatedDevice`] is the bundled one.

#![deny(missing_docs)]

pub mod executor;
pub mod handler;
pub mod simulator;

pub use executor::{status_payload, DeviceCommandExecutor, ExecutorError};
pub use handler::{CommandHandler, HandlerError};
pub use simulator::SimulatedDevice;
