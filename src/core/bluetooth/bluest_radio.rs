//! `Radio` implementation on top of bluest
//! Each request spawns a short task on the current runtime and reports its
//! outcome through the radio sink. Writes go through one writer task so
//! chunks reach the peripheral in the order they were issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use bluest::{Adapter, AdapterEvent, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::radio::{PinnedSink, Radio, RadioEvent, RadioSink};
use crate::core::bluetooth::types::{AdapterState, DeviceId};

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct WriteRequest {
    characteristic: Uuid,
    data: Vec<u8>,
    outcome: PinnedSink,
}

pub struct BluestRadio {
    adapter: Adapter,
    sink: RadioSink,
    /// Devices seen while scanning, by platform id
    devices: Shared<HashMap<DeviceId, Device>>,
    /// Characteristics of the connected device, filled by service discovery
    characteristics: Shared<HashMap<Uuid, Characteristic>>,
    scan_token: Option<CancellationToken>,
    notify_tokens: HashMap<Uuid, CancellationToken>,
    writer: mpsc::UnboundedSender<WriteRequest>,
    shutdown: CancellationToken,
}

impl BluestRadio {
    /// Opens the default adapter and starts reporting its availability.
    pub async fn new(sink: RadioSink) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        let shutdown = CancellationToken::new();
        let characteristics: Shared<HashMap<Uuid, Characteristic>> = Arc::default();

        let (writer, requests) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_task(requests, characteristics.clone()));
        tokio::spawn(Self::adapter_task(
            adapter.clone(),
            sink.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            adapter,
            sink,
            devices: Arc::default(),
            characteristics,
            scan_token: None,
            notify_tokens: HashMap::new(),
            writer,
            shutdown,
        })
    }

    fn device(&self, id: &DeviceId) -> Option<Device> {
        lock(&self.devices).get(id).cloned()
    }

    async fn adapter_task(adapter: Adapter, sink: RadioSink, shutdown: CancellationToken) {
        tokio::select! {
            result = adapter.wait_available() => match result {
                Ok(()) => {
                    info!("Bluetooth adapter is available.");
                    sink.emit(RadioEvent::AdapterState(AdapterState::PoweredOn));
                }
                Err(e) => {
                    error!("Bluetooth adapter unavailable: {}", e);
                    sink.emit(RadioEvent::AdapterState(AdapterState::Unsupported));
                    return;
                }
            },
            _ = shutdown.cancelled() => return,
        }

        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Adapter events unavailable: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(AdapterEvent::Available)) => {
                        sink.emit(RadioEvent::AdapterState(AdapterState::PoweredOn));
                    }
                    Some(Ok(AdapterEvent::Unavailable)) => {
                        sink.emit(RadioEvent::AdapterState(AdapterState::PoweredOff));
                    }
                    Some(Err(e)) => {
                        error!("Error in adapter event stream: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Adapter event stream ended");
    }

    async fn scan_task(
        adapter: Adapter,
        filters: Vec<Uuid>,
        devices: Shared<HashMap<DeviceId, Device>>,
        sink: RadioSink,
        cancel_token: CancellationToken,
    ) {
        info!("Starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&filters).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => match result {
                    Some(discovered) => {
                        let device = discovered.device;
                        let id = DeviceId::new(device.id().to_string());
                        let name = discovered
                            .adv_data
                            .local_name
                            .or_else(|| device.name().ok());
                        debug!("Found device - ID: {}, RSSI: {:?}", id, discovered.rssi);
                        lock(&devices).insert(id.clone(), device);
                        sink.emit(RadioEvent::Discovered {
                            device: id,
                            name,
                            rssi: discovered.rssi,
                        });
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    async fn discover_task(
        device: Device,
        id: DeviceId,
        characteristics: Shared<HashMap<Uuid, Characteristic>>,
        sink: PinnedSink,
    ) {
        let services = match device.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                sink.emit(RadioEvent::DiscoveryFailed {
                    device: id,
                    cause: e.to_string(),
                });
                return;
            }
        };

        for service in services {
            let found = match service.characteristics().await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Could not list characteristics of {}: {}", service.uuid(), e);
                    continue;
                }
            };
            let uuids: Vec<Uuid> = found.iter().map(|c| c.uuid()).collect();
            debug!("Service {} has characteristics {:?}", service.uuid(), uuids);
            lock(&characteristics).extend(found.into_iter().map(|c| (c.uuid(), c)));
            sink.emit(RadioEvent::ServiceDiscovered {
                device: id.clone(),
                service: service.uuid(),
                characteristics: uuids,
            });
        }
        sink.emit(RadioEvent::DiscoveryComplete(id));
    }

    /// Forwards notifications until cancelled. A stream that ends on its own
    /// means the link dropped, reported under the generation of `link`.
    async fn notify_task(
        characteristic: Characteristic,
        device: DeviceId,
        sink: RadioSink,
        link: PinnedSink,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for notifications on {}...", characteristic.uuid());
        let cause = match characteristic.notify().await {
            Ok(mut notification_stream) => loop {
                tokio::select! {
                    result = notification_stream.next() => match result {
                        Some(Ok(value)) => {
                            debug!("Received notification: {:02X?}", value);
                            sink.emit(RadioEvent::Notification {
                                characteristic: characteristic.uuid(),
                                value,
                            });
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break Some(e.to_string());
                        }
                        None => break None,
                    },
                    _ = cancel_token.cancelled() => {
                        debug!("Notifications on {} disabled", characteristic.uuid());
                        return;
                    }
                }
            },
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                Some(e.to_string())
            }
        };

        info!("Notification stream ended");
        link.emit(RadioEvent::Disconnected { device, cause });
    }

    async fn write_task(
        mut requests: mpsc::UnboundedReceiver<WriteRequest>,
        characteristics: Shared<HashMap<Uuid, Characteristic>>,
    ) {
        while let Some(WriteRequest {
            characteristic,
            data,
            outcome: sink,
        }) = requests.recv().await
        {
            let target = lock(&characteristics).get(&characteristic).cloned();
            let Some(target) = target else {
                sink.emit(RadioEvent::WriteFailed {
                    characteristic,
                    cause: "characteristic not discovered".to_string(),
                });
                continue;
            };
            match target.write(&data).await {
                Ok(()) => {
                    sink.emit(RadioEvent::WriteCompleted { characteristic });
                }
                Err(e) => {
                    sink.emit(RadioEvent::WriteFailed {
                        characteristic,
                        cause: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Radio for BluestRadio {
    fn start_scan(&mut self, service_filters: &[Uuid]) {
        self.stop_scan();
        let cancel_token = CancellationToken::new();
        self.scan_token = Some(cancel_token.clone());
        tokio::spawn(Self::scan_task(
            self.adapter.clone(),
            service_filters.to_vec(),
            self.devices.clone(),
            self.sink.clone(),
            cancel_token,
        ));
    }

    fn stop_scan(&mut self) {
        if let Some(cancel_token) = self.scan_token.take() {
            info!("Stopping Bluetooth scan.");
            cancel_token.cancel();
        }
    }

    fn connect(&mut self, id: &DeviceId) {
        let Some(device) = self.device(id) else {
            self.sink.emit(RadioEvent::ConnectFailed {
                device: id.clone(),
                cause: "device was not discovered".to_string(),
            });
            return;
        };
        lock(&self.characteristics).clear();

        let adapter = self.adapter.clone();
        let sink = self.sink.pinned();
        let id = id.clone();
        tokio::spawn(async move {
            match adapter.connect_device(&device).await {
                Ok(()) => sink.emit(RadioEvent::Connected(id)),
                Err(e) => sink.emit(RadioEvent::ConnectFailed {
                    device: id,
                    cause: e.to_string(),
                }),
            };
        });
    }

    fn disconnect(&mut self, id: &DeviceId) {
        for (_, cancel_token) in self.notify_tokens.drain() {
            cancel_token.cancel();
        }
        let Some(device) = self.device(id) else {
            return;
        };

        let adapter = self.adapter.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if !device.is_connected().await {
                info!("Device {} not connected", id);
                return;
            }
            info!("Disconnecting from device {}", id);
            if let Err(e) = adapter.disconnect_device(&device).await {
                error!("Failed to disconnect from {}: {}", id, e);
            }
        });
    }

    fn discover_services(&mut self, id: &DeviceId) {
        let Some(device) = self.device(id) else {
            self.sink.emit(RadioEvent::DiscoveryFailed {
                device: id.clone(),
                cause: "device was not discovered".to_string(),
            });
            return;
        };
        tokio::spawn(Self::discover_task(
            device,
            id.clone(),
            self.characteristics.clone(),
            self.sink.pinned(),
        ));
    }

    fn set_notify(&mut self, id: &DeviceId, characteristic: Uuid, enabled: bool) {
        if !enabled {
            if let Some(cancel_token) = self.notify_tokens.remove(&characteristic) {
                cancel_token.cancel();
            }
            return;
        }
        if self.notify_tokens.contains_key(&characteristic) {
            return;
        }

        let target = lock(&self.characteristics).get(&characteristic).cloned();
        let Some(target) = target else {
            warn!("Cannot subscribe to undiscovered characteristic {}", characteristic);
            self.sink.emit(RadioEvent::DiscoveryFailed {
                device: id.clone(),
                cause: format!("characteristic {} was not discovered", characteristic),
            });
            return;
        };
        let cancel_token = self.shutdown.child_token();
        self.notify_tokens.insert(characteristic, cancel_token.clone());
        tokio::spawn(Self::notify_task(
            target,
            id.clone(),
            self.sink.clone(),
            self.sink.pinned(),
            cancel_token,
        ));
    }

    fn write(&mut self, _device: &DeviceId, characteristic: Uuid, data: &[u8]) {
        let request = WriteRequest {
            characteristic,
            data: data.to_vec(),
            outcome: self.sink.pinned(),
        };
        if self.writer.send(request).is_err() {
            self.sink.emit(RadioEvent::WriteFailed {
                characteristic,
                cause: "writer task stopped".to_string(),
            });
        }
    }
}

impl Drop for BluestRadio {
    fn drop(&mut self) {
        self.stop_scan();
        self.shutdown.cancel();
    }
}
