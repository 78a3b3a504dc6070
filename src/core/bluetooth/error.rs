//! Error types for the link controller

use thiserror::Error;

/// Errors surfaced by the link controller.
///
/// `ExchangeInProgress`, `NoActiveConnection`, `ConnectionBusy` and
/// `InvalidChunkSize` are caller misuse: they are returned synchronously and
/// never change controller state. The rest are reported through
/// [`LinkEvent::Error`](crate::core::bluetooth::LinkEvent::Error).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("No supported read/write characteristic pair found")]
    EndpointsNotFound,

    #[error("An exchange is already in progress")]
    ExchangeInProgress,

    #[error("No active connection")]
    NoActiveConnection,

    #[error("Device did not answer within the pairing window")]
    PairingTimeout,

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("A connection is already active or in progress")]
    ConnectionBusy,

    #[error("Bluetooth adapter not available")]
    AdapterUnavailable,

    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("Link controller has shut down")]
    ControllerClosed,
}
