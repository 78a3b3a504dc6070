use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{
    DEFAULT_PAIRING_RETRY_BUDGET, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SCAN_WINDOW_SECS,
    FRAME_CHUNK_SIZE, STATUS_REQUEST_FRAME,
};
use crate::core::bluetooth::resolver::default_variants;
use crate::core::bluetooth::types::ProtocolVariant;
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "link_config.json";
const CONFIG_DIR_NAME: &str = "ble-link";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Length of one discovery window, in seconds.
    pub scan_window_secs: u64,

    /// Poll cadence, in milliseconds.
    pub poll_interval_ms: u64,

    /// Unanswered poll ticks before an exchange ends in a pairing timeout.
    pub pairing_retry_budget: u32,

    /// Maximum bytes per outbound write.
    pub chunk_size: usize,

    /// Start keepalive status polling as soon as the link is ready.
    pub poll_on_ready: bool,

    /// Frame sent by keepalive polling.
    pub status_request: Vec<u8>,

    /// Ignore advertisers that carry no name.
    pub skip_unnamed_devices: bool,

    /// Supported GATT layouts, preferred first.
    pub variants: Vec<ProtocolVariant>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            scan_window_secs: DEFAULT_SCAN_WINDOW_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            pairing_retry_budget: DEFAULT_PAIRING_RETRY_BUDGET,
            chunk_size: FRAME_CHUNK_SIZE,
            poll_on_ready: false,
            status_request: STATUS_REQUEST_FRAME.to_vec(),
            skip_unnamed_devices: true,
            variants: default_variants(),
        }
    }
}

impl LinkConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        // a zero period would stall the cadence timer
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Default location of the config file in the user config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads the config from `path`, falling back to defaults when the file
    /// does not exist.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config to `path`, creating the parent directory if needed.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize link config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Link config saved to {:?}.", path);
        Ok(())
    }
}
