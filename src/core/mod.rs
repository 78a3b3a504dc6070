//! Core functionality of the link controller

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, LinkHandle};
