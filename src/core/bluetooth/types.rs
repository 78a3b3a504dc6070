//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::error::LinkError;

/// Platform-specific stable identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device
    pub id: DeviceId,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The last seen signal strength (RSSI)
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Creates a new DiscoveredDevice instance
    pub fn new(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { id, name, rssi }
    }

    /// MAC address embedded in the platform id, if there is one.
    /// On macOS the id is an opaque UUID and this returns `None`.
    pub fn address(&self) -> Option<String> {
        extract_mac_address(self.id.as_str())
    }
}

fn extract_mac_address(device_id: &str) -> Option<String> {
    static MAC: OnceLock<Regex> = OnceLock::new();
    let re = MAC.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("valid MAC regex")
    });
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

/// Availability of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl AdapterState {
    /// Whether a scan can be started. `Unknown` is optimistic: the adapter
    /// may simply not have reported yet.
    pub fn allows_scanning(self) -> bool {
        matches!(self, AdapterState::Unknown | AdapterState::PoweredOn)
    }
}

/// Which generation of the peripheral's GATT layout a variant describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariantKind {
    Legacy,
    Current,
}

/// One supported (service, write, read) identifier triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVariant {
    pub kind: VariantKind,
    pub service: Uuid,
    pub write: Uuid,
    pub read: Uuid,
}

/// Resolved write and read/notify endpoints of one protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointSet {
    pub variant: VariantKind,
    pub write: Uuid,
    pub read: Uuid,
}

/// Why a ready link went down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// The caller asked for the disconnect
    LocalRequest,
    /// The radio reported the link lost
    Remote(Option<String>),
}

/// Why a connection attempt (or a ready link) ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureCause {
    Radio(String),
    ServiceDiscovery(String),
    EndpointsNotFound,
    DisconnectedBeforeReady(Option<String>),
    WriteFailed(String),
    Cancelled,
}

impl FailureCause {
    /// Error reported to the caller, if any. A cancelled attempt was asked
    /// for and is not reported.
    pub fn to_error(&self) -> Option<LinkError> {
        match self {
            FailureCause::Radio(cause) => Some(LinkError::ConnectFailed(cause.clone())),
            FailureCause::ServiceDiscovery(cause) => Some(LinkError::ConnectFailed(format!(
                "service discovery failed: {cause}"
            ))),
            FailureCause::EndpointsNotFound => Some(LinkError::EndpointsNotFound),
            FailureCause::DisconnectedBeforeReady(cause) => Some(LinkError::ConnectFailed(
                match cause {
                    Some(cause) => format!("disconnected before ready: {cause}"),
                    None => "disconnected before ready".to_string(),
                },
            )),
            FailureCause::WriteFailed(cause) => Some(LinkError::WriteFailed(cause.clone())),
            FailureCause::Cancelled => None,
        }
    }
}

/// Connection state of the single managed peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting(DeviceId),
    Resolving(DeviceId),
    Ready {
        device: DeviceId,
        endpoints: EndpointSet,
    },
    Disconnected(DisconnectReason),
    Failed {
        device: DeviceId,
        cause: FailureCause,
    },
}

impl ConnectionState {
    /// Device of an attempt or link that is still live
    pub fn active_device(&self) -> Option<&DeviceId> {
        match self {
            ConnectionState::Connecting(device)
            | ConnectionState::Resolving(device)
            | ConnectionState::Ready { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready { .. })
    }
}

/// Everything the controller reports to the application, in order, through
/// one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    AdapterStateChanged(AdapterState),
    ScanStarted,
    DeviceDiscovered(DiscoveredDevice),
    DeviceUpdated(DiscoveredDevice),
    /// Deduplicated devices seen during a window that ran to expiry
    ScanFinished(Vec<DiscoveredDevice>),
    StateChanged(ConnectionState),
    EndpointsReady(EndpointSet),
    /// Notification that answered the pending exchange
    Response(Vec<u8>),
    /// Notification received with no exchange pending
    Unsolicited(Vec<u8>),
    Error(LinkError),
}
