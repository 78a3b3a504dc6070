//! BLE link library
//! Manages the radio link to a single peripheral: discovery, connection,
//! endpoint resolution and the request/response exchange.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use crate::config::LinkConfig;
pub use crate::core::bluetooth::{BluetoothManager, LinkError, LinkEvent, LinkHandle};
