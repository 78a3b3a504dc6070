//! Connection lifecycle for the managed peripheral
//! This module owns the `ConnectionState` and is the only place it changes.
//! Every transition that gives up on a device runs the same cleanup:
//! disable the notifications this controller enabled, then disconnect.

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::radio::{Generation, Radio};
use crate::core::bluetooth::resolver::EndpointResolver;
use crate::core::bluetooth::types::{
    ConnectionState, DeviceId, DisconnectReason, EndpointSet, FailureCause, ProtocolVariant,
};

/// What a lifecycle input did, for the manager to act on
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Connecting,
    Resolving,
    Ready(EndpointSet),
    Failed(FailureCause),
    Disconnected(DisconnectReason),
}

pub struct ConnectionLifecycle {
    state: ConnectionState,
    resolver: EndpointResolver,
    /// Characteristics this controller turned notifications on for
    notifying: Vec<Uuid>,
    generation: Generation,
    /// Generation the current attempt started at
    attempt: u64,
}

impl ConnectionLifecycle {
    pub fn new(variants: Vec<ProtocolVariant>, generation: Generation) -> Self {
        Self {
            state: ConnectionState::Idle,
            resolver: EndpointResolver::new(variants),
            notifying: Vec::new(),
            attempt: generation.current(),
            generation,
        }
    }

    /// Whether an event stamped with `generation` can belong to the current
    /// attempt. Outcomes of earlier attempts carry an older stamp.
    pub fn is_current(&self, generation: u64) -> bool {
        generation >= self.attempt
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Device and endpoints of a ready link
    pub fn ready(&self) -> Option<(&DeviceId, &EndpointSet)> {
        match &self.state {
            ConnectionState::Ready { device, endpoints } => Some((device, endpoints)),
            _ => None,
        }
    }

    /// Start connecting to `device`
    pub fn connect<R: Radio>(
        &mut self,
        radio: &mut R,
        device: DeviceId,
    ) -> Result<Transition, LinkError> {
        if self.state.active_device().is_some() {
            return Err(LinkError::ConnectionBusy);
        }
        self.attempt = self.generation.advance();
        info!("Initiating connection to {}...", device);
        radio.connect(&device);
        self.notifying.clear();
        self.resolver.reset();
        self.state = ConnectionState::Connecting(device);
        Ok(Transition::Connecting)
    }

    pub fn on_connected<R: Radio>(
        &mut self,
        radio: &mut R,
        device: &DeviceId,
    ) -> Option<Transition> {
        match &self.state {
            ConnectionState::Connecting(current) if current == device => {
                info!("Connection successful, discovering services...");
                radio.discover_services(device);
                self.state = ConnectionState::Resolving(device.clone());
                Some(Transition::Resolving)
            }
            _ => {
                debug!("Ignoring connect report for {} in state {:?}", device, self.state);
                None
            }
        }
    }

    pub fn on_connect_failed<R: Radio>(
        &mut self,
        radio: &mut R,
        device: &DeviceId,
        cause: String,
    ) -> Option<Transition> {
        if !self.is_attempting(device) {
            debug!("Ignoring connect failure for {}: {}", device, cause);
            return None;
        }
        warn!("Connection to {} failed: {}", device, cause);
        Some(self.fail(radio, FailureCause::Radio(cause)))
    }

    pub fn on_service_discovered<R: Radio>(
        &mut self,
        radio: &mut R,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Option<Transition> {
        match &self.state {
            ConnectionState::Resolving(current) if current == device => {}
            _ => return None,
        }
        let endpoints = self.resolver.observe(service, characteristics)?;
        self.enable_notify(radio, device, endpoints.read);
        self.state = ConnectionState::Ready {
            device: device.clone(),
            endpoints,
        };
        info!("Link to {} ready ({:?} protocol)", device, endpoints.variant);
        Some(Transition::Ready(endpoints))
    }

    pub fn on_discovery_complete<R: Radio>(
        &mut self,
        radio: &mut R,
        device: &DeviceId,
    ) -> Option<Transition> {
        match &self.state {
            ConnectionState::Resolving(current) if current == device => {}
            _ => return None,
        }
        match self.resolver.finish() {
            // observe() already moved us to Ready when this succeeds
            Ok(_) => None,
            Err(_) => {
                warn!("Service discovery on {} found no supported endpoints", device);
                Some(self.fail(radio, FailureCause::EndpointsNotFound))
            }
        }
    }

    pub fn on_discovery_failed<R: Radio>(
        &mut self,
        radio: &mut R,
        device: &DeviceId,
        cause: String,
    ) -> Option<Transition> {
        // A ready link whose notify endpoint cannot be subscribed is unusable
        match &self.state {
            ConnectionState::Resolving(current) | ConnectionState::Ready { device: current, .. }
                if current == device => {}
            _ => return None,
        }
        warn!("Service discovery on {} failed: {}", device, cause);
        Some(self.fail(radio, FailureCause::ServiceDiscovery(cause)))
    }

    pub fn on_disconnected(
        &mut self,
        device: &DeviceId,
        cause: Option<String>,
    ) -> Option<Transition> {
        match &self.state {
            ConnectionState::Ready { device: current, .. } if current == device => {
                info!("Lost connection to {}", device);
                self.notifying.clear();
                let reason = DisconnectReason::Remote(cause);
                self.state = ConnectionState::Disconnected(reason.clone());
                Some(Transition::Disconnected(reason))
            }
            ConnectionState::Connecting(current) | ConnectionState::Resolving(current)
                if current == device =>
            {
                warn!("{} disconnected before the link was ready", device);
                self.notifying.clear();
                let cause = FailureCause::DisconnectedBeforeReady(cause);
                self.state = ConnectionState::Failed {
                    device: device.clone(),
                    cause: cause.clone(),
                };
                Some(Transition::Failed(cause))
            }
            _ => {
                debug!("Ignoring disconnect report for {}", device);
                None
            }
        }
    }

    /// A write on the ready link failed at the transport level
    pub fn on_write_failed<R: Radio>(
        &mut self,
        radio: &mut R,
        cause: String,
    ) -> Option<Transition> {
        if !self.state.is_ready() {
            return None;
        }
        Some(self.fail(radio, FailureCause::WriteFailed(cause)))
    }

    /// Caller-requested teardown. A no-op when nothing is live.
    pub fn disconnect<R: Radio>(&mut self, radio: &mut R) -> Option<Transition> {
        match self.state.clone() {
            ConnectionState::Ready { device, .. } => {
                info!("Disconnecting from device {}", device);
                self.cleanup(radio, &device);
                self.state = ConnectionState::Disconnected(DisconnectReason::LocalRequest);
                Some(Transition::Disconnected(DisconnectReason::LocalRequest))
            }
            ConnectionState::Connecting(_) | ConnectionState::Resolving(_) => {
                info!("Cancelling connection attempt");
                Some(self.fail(radio, FailureCause::Cancelled))
            }
            _ => {
                debug!("Disconnect requested with no live connection");
                None
            }
        }
    }

    fn is_attempting(&self, device: &DeviceId) -> bool {
        matches!(
            &self.state,
            ConnectionState::Connecting(current) | ConnectionState::Resolving(current)
                if current == device
        )
    }

    fn enable_notify<R: Radio>(&mut self, radio: &mut R, device: &DeviceId, characteristic: Uuid) {
        if self.notifying.contains(&characteristic) {
            return;
        }
        info!("Subscribing to notifications on {}", characteristic);
        radio.set_notify(device, characteristic, true);
        self.notifying.push(characteristic);
    }

    fn cleanup<R: Radio>(&mut self, radio: &mut R, device: &DeviceId) {
        debug!("Cleaning up connection to {}", device);
        for characteristic in self.notifying.drain(..) {
            radio.set_notify(device, characteristic, false);
        }
        radio.disconnect(device);
    }

    fn fail<R: Radio>(&mut self, radio: &mut R, cause: FailureCause) -> Transition {
        let Some(device) = self.state.active_device().cloned() else {
            return Transition::Failed(cause);
        };
        self.cleanup(radio, &device);
        self.state = ConnectionState::Failed {
            device,
            cause: cause.clone(),
        };
        Transition::Failed(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{
        UUID_CURRENT_READ_CHAR, UUID_CURRENT_SERVICE, UUID_CURRENT_WRITE_CHAR, UUID_LEGACY_SERVICE,
        UUID_LEGACY_WRITE_CHAR,
    };
    use crate::core::bluetooth::resolver::default_variants;

    #[derive(Debug, PartialEq)]
    enum Call {
        Connect(DeviceId),
        Disconnect(DeviceId),
        Discover(DeviceId),
        Notify(Uuid, bool),
    }

    #[derive(Default)]
    struct Recorder(Vec<Call>);

    impl Radio for Recorder {
        fn start_scan(&mut self, _: &[Uuid]) {}
        fn stop_scan(&mut self) {}
        fn connect(&mut self, device: &DeviceId) {
            self.0.push(Call::Connect(device.clone()));
        }
        fn disconnect(&mut self, device: &DeviceId) {
            self.0.push(Call::Disconnect(device.clone()));
        }
        fn discover_services(&mut self, device: &DeviceId) {
            self.0.push(Call::Discover(device.clone()));
        }
        fn set_notify(&mut self, _: &DeviceId, characteristic: Uuid, enabled: bool) {
            self.0.push(Call::Notify(characteristic, enabled));
        }
        fn write(&mut self, _: &DeviceId, _: Uuid, _: &[u8]) {}
    }

    fn dev() -> DeviceId {
        DeviceId::new("valve-1")
    }

    fn resolving(radio: &mut Recorder) -> ConnectionLifecycle {
        let mut lifecycle = ConnectionLifecycle::new(default_variants(), Generation::default());
        lifecycle.connect(radio, dev()).unwrap();
        lifecycle.on_connected(radio, &dev());
        lifecycle
    }

    fn ready(radio: &mut Recorder) -> ConnectionLifecycle {
        let mut lifecycle = resolving(radio);
        lifecycle.on_service_discovered(
            radio,
            &dev(),
            UUID_CURRENT_SERVICE,
            &[UUID_CURRENT_WRITE_CHAR, UUID_CURRENT_READ_CHAR],
        );
        lifecycle
    }

    #[test]
    fn happy_path_reaches_ready_and_subscribes_once() {
        let mut radio = Recorder::default();
        let mut lifecycle = resolving(&mut radio);
        assert_eq!(lifecycle.state(), &ConnectionState::Resolving(dev()));

        let transition = lifecycle.on_service_discovered(
            &mut radio,
            &dev(),
            UUID_CURRENT_SERVICE,
            &[UUID_CURRENT_WRITE_CHAR, UUID_CURRENT_READ_CHAR],
        );
        assert!(matches!(transition, Some(Transition::Ready(_))));
        assert!(lifecycle.state().is_ready());

        // Late reports after ready change nothing
        assert!(lifecycle.on_discovery_complete(&mut radio, &dev()).is_none());
        assert_eq!(
            radio.0,
            vec![
                Call::Connect(dev()),
                Call::Discover(dev()),
                Call::Notify(UUID_CURRENT_READ_CHAR, true),
            ]
        );
    }

    #[test]
    fn missing_read_characteristic_fails_and_disconnects() {
        let mut radio = Recorder::default();
        let mut lifecycle = resolving(&mut radio);
        assert!(lifecycle
            .on_service_discovered(
                &mut radio,
                &dev(),
                UUID_LEGACY_SERVICE,
                &[UUID_LEGACY_WRITE_CHAR],
            )
            .is_none());

        let transition = lifecycle.on_discovery_complete(&mut radio, &dev());
        assert_eq!(transition, Some(Transition::Failed(FailureCause::EndpointsNotFound)));
        assert_eq!(
            lifecycle.state(),
            &ConnectionState::Failed {
                device: dev(),
                cause: FailureCause::EndpointsNotFound
            }
        );
        assert_eq!(radio.0.last(), Some(&Call::Disconnect(dev())));
    }

    #[test]
    fn connect_failure_runs_cleanup() {
        let mut radio = Recorder::default();
        let mut lifecycle = ConnectionLifecycle::new(default_variants(), Generation::default());
        lifecycle.connect(&mut radio, dev()).unwrap();
        let transition = lifecycle.on_connect_failed(&mut radio, &dev(), "timeout".into());
        assert_eq!(
            transition,
            Some(Transition::Failed(FailureCause::Radio("timeout".into())))
        );
        assert_eq!(radio.0.last(), Some(&Call::Disconnect(dev())));
    }

    #[test]
    fn disconnect_before_ready_is_a_failure() {
        let mut radio = Recorder::default();
        let mut lifecycle = resolving(&mut radio);
        let transition = lifecycle.on_disconnected(&dev(), None);
        assert_eq!(
            transition,
            Some(Transition::Failed(FailureCause::DisconnectedBeforeReady(None)))
        );
        assert!(matches!(lifecycle.state(), ConnectionState::Failed { .. }));
    }

    #[test]
    fn disconnect_after_ready_is_a_disconnect() {
        let mut radio = Recorder::default();
        let mut lifecycle = ready(&mut radio);
        let transition = lifecycle.on_disconnected(&dev(), Some("link loss".into()));
        assert_eq!(
            transition,
            Some(Transition::Disconnected(DisconnectReason::Remote(Some(
                "link loss".into()
            ))))
        );
        assert!(lifecycle.ready().is_none());
    }

    #[test]
    fn local_disconnect_disables_notifications_and_is_idempotent() {
        let mut radio = Recorder::default();
        let mut lifecycle = ready(&mut radio);
        radio.0.clear();

        assert_eq!(
            lifecycle.disconnect(&mut radio),
            Some(Transition::Disconnected(DisconnectReason::LocalRequest))
        );
        assert_eq!(
            radio.0,
            vec![
                Call::Notify(UUID_CURRENT_READ_CHAR, false),
                Call::Disconnect(dev()),
            ]
        );
        assert!(lifecycle.disconnect(&mut radio).is_none());
        assert_eq!(radio.0.len(), 2);
    }

    #[test]
    fn cancelling_an_attempt_fails_it_once() {
        let mut radio = Recorder::default();
        let mut lifecycle = ConnectionLifecycle::new(default_variants(), Generation::default());
        lifecycle.connect(&mut radio, dev()).unwrap();
        assert_eq!(
            lifecycle.disconnect(&mut radio),
            Some(Transition::Failed(FailureCause::Cancelled))
        );
        assert!(lifecycle.disconnect(&mut radio).is_none());
        // A late connect report for the cancelled attempt is ignored
        assert!(lifecycle.on_connected(&mut radio, &dev()).is_none());
    }

    #[test]
    fn connect_while_busy_is_rejected_without_side_effects() {
        let mut radio = Recorder::default();
        let mut lifecycle = ready(&mut radio);
        let calls = radio.0.len();
        assert_eq!(
            lifecycle.connect(&mut radio, DeviceId::new("other")),
            Err(LinkError::ConnectionBusy)
        );
        assert_eq!(radio.0.len(), calls);
        assert!(lifecycle.state().is_ready());
    }

    #[test]
    fn reports_for_other_devices_are_ignored() {
        let mut radio = Recorder::default();
        let mut lifecycle = resolving(&mut radio);
        let other = DeviceId::new("other");
        assert!(lifecycle.on_disconnected(&other, None).is_none());
        assert!(lifecycle.on_discovery_complete(&mut radio, &other).is_none());
        assert_eq!(lifecycle.state(), &ConnectionState::Resolving(dev()));
    }

    #[test]
    fn each_attempt_starts_a_new_generation() {
        let mut radio = Recorder::default();
        let generation = Generation::default();
        let mut lifecycle = ConnectionLifecycle::new(default_variants(), generation.clone());
        lifecycle.connect(&mut radio, dev()).unwrap();
        let first = generation.current();
        lifecycle.disconnect(&mut radio);
        lifecycle.connect(&mut radio, dev()).unwrap();

        assert!(!lifecycle.is_current(first));
        assert!(lifecycle.is_current(generation.current()));
    }

    #[test]
    fn discovery_failure_after_ready_fails_the_link() {
        let mut radio = Recorder::default();
        let mut lifecycle = ready(&mut radio);
        let transition =
            lifecycle.on_discovery_failed(&mut radio, &dev(), "notify unavailable".into());
        assert_eq!(
            transition,
            Some(Transition::Failed(FailureCause::ServiceDiscovery(
                "notify unavailable".into()
            )))
        );
        assert_eq!(
            radio.0[radio.0.len() - 2..],
            [
                Call::Notify(UUID_CURRENT_READ_CHAR, false),
                Call::Disconnect(dev()),
            ]
        );
    }

    #[test]
    fn reconnect_is_allowed_after_failure() {
        let mut radio = Recorder::default();
        let mut lifecycle = ConnectionLifecycle::new(default_variants(), Generation::default());
        lifecycle.connect(&mut radio, dev()).unwrap();
        lifecycle.on_connect_failed(&mut radio, &dev(), "busy".into());
        assert_eq!(lifecycle.connect(&mut radio, dev()), Ok(Transition::Connecting));
    }
}
