//! Constants used throughout the link controller
//! This module contains the well-known GATT identifiers of both protocol
//! variants, timing defaults and the status request frame.

use uuid::Uuid;

/// Service of the current protocol variant
pub const UUID_CURRENT_SERVICE: Uuid = Uuid::from_u128(0x267f0001_eb15_43f5_94c3_67d2221188f7);

/// Write characteristic of the current protocol variant
pub const UUID_CURRENT_WRITE_CHAR: Uuid = Uuid::from_u128(0x267f0002_eb15_43f5_94c3_67d2221188f7);

/// Read/notify characteristic of the current protocol variant
pub const UUID_CURRENT_READ_CHAR: Uuid = Uuid::from_u128(0x267f0003_eb15_43f5_94c3_67d2221188f7);

/// Service of the legacy protocol variant
pub const UUID_LEGACY_SERVICE: Uuid = Uuid::from_u128(0xbccb0001_ca66_11e5_88a4_0002a5d5c51b);

/// Write characteristic of the legacy protocol variant
pub const UUID_LEGACY_WRITE_CHAR: Uuid = Uuid::from_u128(0xbccb0002_ca66_11e5_88a4_0002a5d5c51b);

/// Read/notify characteristic of the legacy protocol variant
pub const UUID_LEGACY_READ_CHAR: Uuid = Uuid::from_u128(0xbccb0003_ca66_11e5_88a4_0002a5d5c51b);

/// Outbound sub-frame size in bytes (minimum negotiated ATT payload)
pub const FRAME_CHUNK_SIZE: usize = 20;

/// Scan window in seconds
pub const DEFAULT_SCAN_WINDOW_SECS: u64 = 5;

/// Poll cadence in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Unanswered poll ticks before the exchange is declared a pairing timeout
pub const DEFAULT_PAIRING_RETRY_BUDGET: u32 = 30;

/// Status request sent by keepalive polling
pub const STATUS_REQUEST_FRAME: [u8; 7] = [0xAA, 0x55, 0x00, 0x2B, 0x01, 0x02, 0xD3];
