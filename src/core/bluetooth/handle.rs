//! Clonable handle to a running link controller
//! Requests are queued to the controller loop and answered once the loop has
//! applied them, so caller misuse comes back synchronously as an error.

use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::types::{ConnectionState, DeviceId, DiscoveredDevice};

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    StartScan(Reply<Result<(), LinkError>>),
    StopScan(Reply<()>),
    Connect(DeviceId, Reply<Result<(), LinkError>>),
    Disconnect(Reply<()>),
    Send(Vec<u8>, Reply<Result<(), LinkError>>),
    StartPolling(Reply<Result<(), LinkError>>),
    StopPolling(Reply<()>),
    State(Reply<ConnectionState>),
    Devices(Reply<Vec<DiscoveredDevice>>),
}

/// A clonable handle that sends requests to the controller loop.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, LinkError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| LinkError::ControllerClosed)?;
        response.await.map_err(|_| LinkError::ControllerClosed)
    }

    /// Open a discovery window. Restarts the window if one is already open.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        self.request(Command::StartScan).await?
    }

    /// Close the discovery window early. No batch is reported.
    pub async fn stop_scan(&self) -> Result<(), LinkError> {
        self.request(Command::StopScan).await
    }

    pub async fn connect(&self, device: DeviceId) -> Result<(), LinkError> {
        self.request(|reply| Command::Connect(device, reply)).await?
    }

    /// Tear down the link or cancel the attempt in progress
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.request(Command::Disconnect).await
    }

    /// Issue one request frame; the answer arrives as `LinkEvent::Response`
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        self.request(|reply| Command::Send(frame, reply)).await?
    }

    pub async fn start_polling(&self) -> Result<(), LinkError> {
        self.request(Command::StartPolling).await?
    }

    pub async fn stop_polling(&self) -> Result<(), LinkError> {
        self.request(Command::StopPolling).await
    }

    pub async fn state(&self) -> Result<ConnectionState, LinkError> {
        self.request(Command::State).await
    }

    /// Devices of the current or most recent scan window
    pub async fn devices(&self) -> Result<Vec<DiscoveredDevice>, LinkError> {
        self.request(Command::Devices).await
    }
}
