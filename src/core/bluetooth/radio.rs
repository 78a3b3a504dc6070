//! Radio collaborator contract
//! The controller never touches the Bluetooth stack directly. It issues
//! requests through [`Radio`] and receives every outcome as a [`RadioEvent`]
//! pushed through a [`RadioSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::{AdapterState, DeviceId};

/// Requests the controller makes of the radio stack.
///
/// Every method returns immediately; outcomes (connect result, services,
/// write completion, ...) arrive later as [`RadioEvent`]s. Sequential writes
/// must reach the peripheral in the order they were issued.
pub trait Radio {
    fn start_scan(&mut self, service_filters: &[Uuid]);
    fn stop_scan(&mut self);
    fn connect(&mut self, device: &DeviceId);
    fn disconnect(&mut self, device: &DeviceId);
    fn discover_services(&mut self, device: &DeviceId);
    fn set_notify(&mut self, device: &DeviceId, characteristic: Uuid, enabled: bool);
    fn write(&mut self, device: &DeviceId, characteristic: Uuid, data: &[u8]);
}

/// Outcomes and unsolicited input from the radio stack
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    AdapterState(AdapterState),
    Discovered {
        device: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    NameUpdated {
        device: DeviceId,
        name: String,
    },
    Connected(DeviceId),
    ConnectFailed {
        device: DeviceId,
        cause: String,
    },
    Disconnected {
        device: DeviceId,
        cause: Option<String>,
    },
    ServiceDiscovered {
        device: DeviceId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    DiscoveryComplete(DeviceId),
    DiscoveryFailed {
        device: DeviceId,
        cause: String,
    },
    WriteCompleted {
        characteristic: Uuid,
    },
    WriteFailed {
        characteristic: Uuid,
        cause: String,
    },
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl RadioEvent {
    /// Outcomes that belong to one connection attempt and must not leak into
    /// the next one
    pub fn concerns_connection(&self) -> bool {
        matches!(
            self,
            RadioEvent::Connected(_)
                | RadioEvent::ConnectFailed { .. }
                | RadioEvent::Disconnected { .. }
                | RadioEvent::ServiceDiscovered { .. }
                | RadioEvent::DiscoveryComplete(_)
                | RadioEvent::DiscoveryFailed { .. }
                | RadioEvent::WriteFailed { .. }
        )
    }
}

/// Exchange generation shared between the controller and the radio sink.
///
/// Advanced on every connection attempt, every armed exchange and every
/// cancellation, so an event stamped before any of them is recognisably
/// stale.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A radio event together with the generation it was emitted under
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped {
    pub generation: u64,
    pub event: RadioEvent,
}

/// Clonable sender the radio uses to report events into the controller loop
#[derive(Debug, Clone)]
pub struct RadioSink {
    tx: mpsc::UnboundedSender<Stamped>,
    generation: Generation,
}

impl RadioSink {
    /// Stamp and enqueue an event. Returns `false` once the controller is gone.
    pub fn emit(&self, event: RadioEvent) -> bool {
        send(&self.tx, self.generation.current(), event)
    }

    /// Sink for the outcome of a request issued now. Its events keep the
    /// generation of this moment, so a result that outlives a cancel or a
    /// newer connection attempt is recognisably stale.
    pub fn pinned(&self) -> PinnedSink {
        PinnedSink {
            tx: self.tx.clone(),
            generation: self.generation.current(),
        }
    }
}

/// A [`RadioSink`] frozen at one generation
#[derive(Debug, Clone)]
pub struct PinnedSink {
    tx: mpsc::UnboundedSender<Stamped>,
    generation: u64,
}

impl PinnedSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: RadioEvent) -> bool {
        send(&self.tx, self.generation, event)
    }
}

fn send(tx: &mpsc::UnboundedSender<Stamped>, generation: u64, event: RadioEvent) -> bool {
    if tx.send(Stamped { generation, event }).is_err() {
        debug!("Radio event dropped: controller loop has shut down");
        return false;
    }
    true
}

/// Both ends of the radio event channel. Build one, hand
/// [`RadioChannel::sink`] to the radio, and pass the channel to
/// [`BluetoothManager::new`](crate::core::bluetooth::BluetoothManager::new).
pub struct RadioChannel {
    sink: RadioSink,
    pub(crate) receiver: mpsc::UnboundedReceiver<Stamped>,
}

impl RadioChannel {
    pub fn new() -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        Self {
            sink: RadioSink {
                tx,
                generation: Generation::default(),
            },
            receiver,
        }
    }

    pub fn sink(&self) -> RadioSink {
        self.sink.clone()
    }

    pub(crate) fn generation(&self) -> Generation {
        self.sink.generation.clone()
    }
}

impl Default for RadioChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_stamped_with_the_generation_at_emit_time() {
        let mut channel = RadioChannel::new();
        let sink = channel.sink();
        let generation = channel.generation();

        assert!(sink.emit(RadioEvent::Connected(DeviceId::new("a"))));
        generation.advance();
        assert!(sink.emit(RadioEvent::DiscoveryComplete(DeviceId::new("a"))));

        let first = channel.receiver.try_recv().unwrap();
        let second = channel.receiver.try_recv().unwrap();
        assert_eq!(first.generation, 0);
        assert_eq!(second.generation, 1);
    }

    #[test]
    fn pinned_sinks_keep_the_generation_of_the_request() {
        let mut channel = RadioChannel::new();
        let sink = channel.sink();
        let generation = channel.generation();

        let pinned = sink.pinned();
        generation.advance();
        assert!(pinned.emit(RadioEvent::Connected(DeviceId::new("a"))));
        assert!(sink.emit(RadioEvent::Connected(DeviceId::new("a"))));

        assert_eq!(channel.receiver.try_recv().unwrap().generation, 0);
        assert_eq!(channel.receiver.try_recv().unwrap().generation, 1);
        assert_eq!(pinned.generation(), 0);
    }

    #[test]
    fn only_link_outcomes_concern_the_connection() {
        let device = DeviceId::new("a");
        assert!(RadioEvent::Connected(device.clone()).concerns_connection());
        assert!(RadioEvent::DiscoveryComplete(device.clone()).concerns_connection());
        assert!(!RadioEvent::NameUpdated {
            device,
            name: "x".into()
        }
        .concerns_connection());
        assert!(!RadioEvent::Notification {
            characteristic: Uuid::nil(),
            value: vec![1]
        }
        .concerns_connection());
    }

    #[test]
    fn emit_reports_a_closed_controller() {
        let channel = RadioChannel::new();
        let sink = channel.sink();
        drop(channel);
        assert!(!sink.emit(RadioEvent::AdapterState(AdapterState::PoweredOn)));
    }
}
