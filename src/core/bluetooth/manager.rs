//! Link controller event loop
//! One task owns every component and applies radio events, caller commands
//! and timer firings strictly one at a time. Timers are reconciled against
//! component state after every step, so no exit path can leave one running.

use std::future::pending;
use std::pin::Pin;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::core::bluetooth::connection::{ConnectionLifecycle, Transition};
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::exchange::{Delivery, ExchangeController, TickOutcome};
use crate::core::bluetooth::handle::{Command, LinkHandle};
use crate::core::bluetooth::radio::{Radio, RadioChannel, RadioEvent, Stamped};
use crate::core::bluetooth::scanner::{ScanRecord, ScanSession};
use crate::core::bluetooth::types::{AdapterState, LinkEvent};

enum Step {
    Shutdown,
    Radio(Option<Stamped>),
    Command(Option<Command>),
    ScanWindowElapsed,
    PollTick,
}

/// Owns the scan session, connection lifecycle and exchange for one
/// peripheral. Build it with [`BluetoothManager::new`] and drive it with
/// [`BluetoothManager::run`].
pub struct BluetoothManager<R: Radio> {
    radio: R,
    config: LinkConfig,
    scanner: ScanSession,
    lifecycle: ConnectionLifecycle,
    exchange: ExchangeController,
    adapter_state: AdapterState,
    radio_events: mpsc::UnboundedReceiver<Stamped>,
    radio_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<LinkEvent>,
    scan_deadline: Option<Pin<Box<Sleep>>>,
    poll_timer: Option<Interval>,
}

impl<R: Radio> BluetoothManager<R> {
    /// Creates a manager around `radio`. The radio must report through a sink
    /// taken from `channel`.
    pub fn new(
        config: LinkConfig,
        radio: R,
        channel: RadioChannel,
    ) -> (Self, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let generation = channel.generation();

        let manager = Self {
            scanner: ScanSession::new(config.skip_unnamed_devices),
            lifecycle: ConnectionLifecycle::new(config.variants.clone(), generation.clone()),
            exchange: ExchangeController::new(
                config.chunk_size,
                config.pairing_retry_budget,
                generation,
            ),
            radio,
            config,
            adapter_state: AdapterState::Unknown,
            radio_events: channel.receiver,
            radio_open: true,
            commands,
            events,
            scan_deadline: None,
            poll_timer: None,
        };
        (manager, LinkHandle::new(command_tx), event_rx)
    }

    /// Runs until `shutdown` fires or every [`LinkHandle`] is dropped, then
    /// tears down any scan and connection.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Link controller started");
        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                event = self.radio_events.recv(), if self.radio_open => Step::Radio(event),
                command = self.commands.recv() => Step::Command(command),
                _ = wait_deadline(&mut self.scan_deadline) => Step::ScanWindowElapsed,
                _ = wait_tick(&mut self.poll_timer) => Step::PollTick,
            };

            match step {
                Step::Shutdown | Step::Command(None) => break,
                Step::Radio(Some(stamped)) => self.handle_radio_event(stamped),
                Step::Radio(None) => {
                    warn!("Radio event channel closed");
                    self.radio_open = false;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::ScanWindowElapsed => self.finish_scan(),
                Step::PollTick => self.handle_poll_tick(),
            }
            self.sync_timers();
        }

        self.stop_scan();
        let transition = self.lifecycle.disconnect(&mut self.radio);
        self.apply(transition);
        self.scan_deadline = None;
        self.poll_timer = None;
        info!("Link controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan(reply) => {
                let _ = reply.send(self.start_scan());
            }
            Command::StopScan(reply) => {
                self.stop_scan();
                let _ = reply.send(());
            }
            Command::Connect(device, reply) => {
                let result = match self.lifecycle.connect(&mut self.radio, device) {
                    Ok(transition) => {
                        self.apply(Some(transition));
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Connect rejected: {}", e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                let transition = self.lifecycle.disconnect(&mut self.radio);
                self.apply(transition);
                let _ = reply.send(());
            }
            Command::Send(frame, reply) => {
                let result = self
                    .exchange
                    .send(&mut self.radio, self.lifecycle.ready(), frame);
                match &result {
                    // The first resend is due one full period after this write
                    Ok(()) => self.poll_timer = None,
                    Err(e) => debug!("Send rejected: {}", e),
                }
                let _ = reply.send(result);
            }
            Command::StartPolling(reply) => {
                let result = self
                    .exchange
                    .start_polling(self.lifecycle.ready(), self.config.status_request.clone());
                let _ = reply.send(result);
            }
            Command::StopPolling(reply) => {
                self.exchange.stop_polling();
                let _ = reply.send(());
            }
            Command::State(reply) => {
                let _ = reply.send(self.lifecycle.state().clone());
            }
            Command::Devices(reply) => {
                let _ = reply.send(self.scanner.devices().to_vec());
            }
        }
    }

    fn start_scan(&mut self) -> Result<(), LinkError> {
        if !self.adapter_state.allows_scanning() {
            warn!("Cannot scan, adapter is {:?}", self.adapter_state);
            return Err(LinkError::AdapterUnavailable);
        }
        if self.scanner.is_active() {
            debug!("Restarting scan window");
            self.radio.stop_scan();
        }

        self.scanner.start();
        let filters: Vec<Uuid> = self.config.variants.iter().map(|v| v.service).collect();
        self.radio.start_scan(&filters);
        self.scan_deadline = Some(Box::pin(sleep(self.config.scan_window())));
        self.emit(LinkEvent::ScanStarted);
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scan_deadline = None;
        if self.scanner.cancel() {
            self.radio.stop_scan();
        }
    }

    fn finish_scan(&mut self) {
        // Discoveries queued in the same tick belong to this window
        while let Ok(stamped) = self.radio_events.try_recv() {
            self.handle_radio_event(stamped);
        }
        self.scan_deadline = None;
        if let Some(devices) = self.scanner.finish() {
            self.radio.stop_scan();
            self.emit(LinkEvent::ScanFinished(devices));
        }
    }

    fn handle_radio_event(&mut self, stamped: Stamped) {
        let Stamped { generation, event } = stamped;
        if event.concerns_connection() && !self.lifecycle.is_current(generation) {
            debug!("Dropping outcome of an earlier connection attempt: {:?}", event);
            return;
        }
        let transition = match event {
            RadioEvent::AdapterState(state) => {
                if state != self.adapter_state {
                    info!("Adapter state changed: {:?}", state);
                    self.adapter_state = state;
                    self.emit(LinkEvent::AdapterStateChanged(state));
                }
                None
            }
            RadioEvent::Discovered { device, name, rssi } => {
                match self.scanner.record(device, name, rssi) {
                    ScanRecord::New(device) => self.emit(LinkEvent::DeviceDiscovered(device)),
                    ScanRecord::Updated(device) => self.emit(LinkEvent::DeviceUpdated(device)),
                    ScanRecord::Ignored => {}
                }
                None
            }
            RadioEvent::NameUpdated { device, name } => {
                if let Some(device) = self.scanner.rename(&device, name) {
                    self.emit(LinkEvent::DeviceUpdated(device));
                }
                None
            }
            RadioEvent::Connected(device) => self.lifecycle.on_connected(&mut self.radio, &device),
            RadioEvent::ConnectFailed { device, cause } => {
                self.lifecycle
                    .on_connect_failed(&mut self.radio, &device, cause)
            }
            RadioEvent::Disconnected { device, cause } => {
                self.lifecycle.on_disconnected(&device, cause)
            }
            RadioEvent::ServiceDiscovered {
                device,
                service,
                characteristics,
            } => self.lifecycle.on_service_discovered(
                &mut self.radio,
                &device,
                service,
                &characteristics,
            ),
            RadioEvent::DiscoveryComplete(device) => {
                self.lifecycle.on_discovery_complete(&mut self.radio, &device)
            }
            RadioEvent::DiscoveryFailed { device, cause } => {
                self.lifecycle
                    .on_discovery_failed(&mut self.radio, &device, cause)
            }
            RadioEvent::WriteCompleted { characteristic } => {
                debug!("Write to {} completed", characteristic);
                None
            }
            RadioEvent::WriteFailed {
                characteristic,
                cause,
            } => {
                error!("Write to {} failed: {}", characteristic, cause);
                self.lifecycle.on_write_failed(&mut self.radio, cause)
            }
            RadioEvent::Notification {
                characteristic,
                value,
            } => {
                self.handle_notification(generation, characteristic, value);
                None
            }
        };
        self.apply(transition);
    }

    fn handle_notification(&mut self, generation: u64, characteristic: Uuid, value: Vec<u8>) {
        let Some((_, endpoints)) = self.lifecycle.ready() else {
            debug!("Notification on {} with no ready link dropped", characteristic);
            return;
        };
        if characteristic != endpoints.read {
            debug!("Notification on unexpected characteristic {} dropped", characteristic);
            return;
        }

        match self.exchange.deliver(generation, value) {
            Delivery::Completed(value) => {
                debug!("Response received: {:02X?}", value);
                self.emit(LinkEvent::Response(value));
            }
            Delivery::Unsolicited(value) => {
                warn!("Unsolicited notification: {:02X?}", value);
                self.emit(LinkEvent::Unsolicited(value));
            }
            Delivery::Stale => {}
        }
    }

    fn handle_poll_tick(&mut self) {
        let outcome = self
            .exchange
            .on_tick(&mut self.radio, self.lifecycle.ready());
        if outcome == TickOutcome::TimedOut {
            error!("Pairing timeout");
            self.emit(LinkEvent::Error(LinkError::PairingTimeout));
        }
    }

    /// Report a lifecycle transition and apply its side effects
    fn apply(&mut self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        self.emit(LinkEvent::StateChanged(self.lifecycle.state().clone()));

        match transition {
            Transition::Connecting | Transition::Resolving => {}
            Transition::Ready(endpoints) => {
                self.emit(LinkEvent::EndpointsReady(endpoints));
                if self.config.poll_on_ready {
                    let started = self
                        .exchange
                        .start_polling(self.lifecycle.ready(), self.config.status_request.clone());
                    if let Err(e) = started {
                        warn!("Could not start keepalive polling: {}", e);
                    }
                }
            }
            Transition::Failed(cause) => {
                self.exchange.cancel();
                if let Some(err) = cause.to_error() {
                    self.emit(LinkEvent::Error(err));
                }
            }
            Transition::Disconnected(_) => self.exchange.cancel(),
        }
    }

    fn sync_timers(&mut self) {
        if !self.scanner.is_active() {
            self.scan_deadline = None;
        }

        if self.exchange.cadence_active() {
            if self.poll_timer.is_none() {
                let period = self.config.poll_interval();
                let mut timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll_timer = Some(timer);
                debug!("Poll cadence started ({:?})", period);
            }
        } else if self.poll_timer.take().is_some() {
            debug!("Poll cadence stopped");
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for link events");
        }
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn wait_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}
