//! ble-link command line client
//!
//! Scans for a peripheral, connects to it and prints whatever it answers.
//!
//! ```bash
//! ble-link --device Valve --poll
//! ble-link --device 2C:BA:BA:A1:B2:C3 --send AA55002B0102D3
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use ble_link::config::LinkConfig;
use ble_link::core::bluetooth::{
    BluestRadio, BluetoothManager, ConnectionState, DiscoveredDevice, LinkEvent, LinkHandle,
    RadioChannel,
};
use ble_link::logging;
use clap::Parser;
use log::{info, LevelFilter};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "ble-link")]
#[command(about = "Connect to a BLE peripheral and exchange request frames")]
struct Args {
    /// Config file path (JSON). Defaults to the user config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to connect to: a name fragment, platform id or MAC address.
    /// The first device found is used when omitted.
    #[arg(short, long)]
    device: Option<String>,

    /// Keep polling the device with status requests once connected
    #[arg(long)]
    poll: bool,

    /// Hex encoded frame to send once connected
    #[arg(long)]
    send: Option<String>,

    /// Only list devices found during one scan window
    #[arg(long)]
    scan_only: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => LinkConfig::default_path().ok_or_else(|| anyhow!("No config directory"))?,
    };
    let config = LinkConfig::load_config(&config_path).await?;
    let frame = args.send.as_deref().map(parse_hex).transpose()?;

    let channel = RadioChannel::new();
    let radio = BluestRadio::new(channel.sink()).await?;
    let (manager, handle, mut events) = BluetoothManager::new(config, radio, channel);
    let shutdown = CancellationToken::new();
    let controller = tokio::spawn(manager.run(shutdown.clone()));

    handle.start_scan().await?;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            LinkEvent::DeviceDiscovered(device) => print_device(&device),
            LinkEvent::ScanFinished(devices) => {
                if args.scan_only {
                    break;
                }
                let Some(target) = select_device(&devices, args.device.as_deref()) else {
                    eprintln!("No matching device found");
                    break;
                };
                println!("Connecting to {}", target.id);
                handle.connect(target.id.clone()).await?;
            }
            LinkEvent::EndpointsReady(endpoints) => {
                println!("Link ready ({:?} protocol)", endpoints.variant);
                on_ready(&handle, args.poll, frame.clone()).await?;
            }
            LinkEvent::Response(value) | LinkEvent::Unsolicited(value) => {
                println!("<- {}", to_hex(&value));
                if !args.poll {
                    break;
                }
            }
            LinkEvent::Error(e) => eprintln!("Error: {}", e),
            LinkEvent::StateChanged(
                state @ (ConnectionState::Disconnected(_) | ConnectionState::Failed { .. }),
            ) => {
                println!("Link closed: {:?}", state);
                break;
            }
            other => log::debug!("{:?}", other),
        }
    }

    shutdown.cancel();
    controller.await.context("Link controller task failed")?;
    Ok(())
}

async fn on_ready(handle: &LinkHandle, poll: bool, frame: Option<Vec<u8>>) -> Result<()> {
    if let Some(frame) = frame {
        println!("-> {}", to_hex(&frame));
        handle.send(frame).await?;
    }
    if poll {
        handle.start_polling().await?;
    }
    Ok(())
}

fn select_device<'a>(
    devices: &'a [DiscoveredDevice],
    wanted: Option<&str>,
) -> Option<&'a DiscoveredDevice> {
    let Some(wanted) = wanted else {
        return devices.first();
    };
    devices.iter().find(|device| {
        device.id.as_str() == wanted
            || device
                .address()
                .is_some_and(|address| address.eq_ignore_ascii_case(wanted))
            || device.name.as_deref().is_some_and(|name| name.contains(wanted))
    })
}

fn print_device(device: &DiscoveredDevice) {
    println!(
        "Found {} ({}) RSSI {}",
        device.name.as_deref().unwrap_or("Unknown"),
        device.address().unwrap_or_else(|| device.id.to_string()),
        device
            .rssi
            .map(|rssi| rssi.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    );
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).with_context(|| format!("Invalid hex frame {:?}", text))
}

fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_parse_with_or_without_spaces() {
        let expected = vec![0xAA, 0x55, 0x00, 0x2B, 0x01, 0x02, 0xD3];
        assert_eq!(parse_hex("AA55002B0102D3").unwrap(), expected);
        assert_eq!(parse_hex("aa 55 00 2b 01 02 d3").unwrap(), expected);
        assert_eq!(to_hex(&expected), "AA55002B0102D3");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(parse_hex("AA5").is_err());
        assert!(parse_hex("ZZ").is_err());
    }
}
