//! Bluetooth link controller
//! Scanning, connection lifecycle, endpoint resolution and the
//! single-in-flight request/response exchange with one peripheral.

pub mod constants;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod exchange;
pub mod frame;
pub(crate) mod handle;
pub(crate) mod manager;
pub(crate) mod radio;
pub(crate) mod resolver;
pub(crate) mod scanner;
pub(crate) mod types;

#[cfg(feature = "bluest-radio")]
mod bluest_radio;

// Re-export types that should be publicly accessible
pub use connection::{ConnectionLifecycle, Transition};
pub use error::LinkError;
pub use exchange::{Delivery, ExchangeController, PendingExchange, TickOutcome};
pub use handle::LinkHandle;
pub use manager::BluetoothManager;
pub use radio::{Generation, PinnedSink, Radio, RadioChannel, RadioEvent, RadioSink, Stamped};
pub use resolver::{default_variants, EndpointResolver};
pub use scanner::{ScanRecord, ScanSession};
pub use types::{
    AdapterState, ConnectionState, DeviceId, DisconnectReason, DiscoveredDevice, EndpointSet,
    FailureCause, LinkEvent, ProtocolVariant, VariantKind,
};

#[cfg(feature = "bluest-radio")]
pub use bluest_radio::BluestRadio;
