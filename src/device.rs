use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    ble::BtleplugPlatform,
    error::{CgmError, Result},
    platform::BlePlatform,
    supervisor::{Command, Event, Supervisor},
    types::{CgmEvent, ConnectionState, DiscoveredDevice, LinkStatus, SupervisorConfig},
};

/// Application handle to a running CGM connection supervisor
///
/// `CgmClient` owns the event loop task that runs the [`Supervisor`]. Commands
/// are queued to that task and return immediately; everything the supervisor
/// reports arrives on the [`CgmEvent`] receiver returned alongside the client.
///
/// # Features
///
/// - **Scanning**: filtered to the CGM service, deduplicated, stops by itself after a timeout
/// - **Pairing**: bonds before connecting when the sensor is not paired yet
/// - **Subscription**: enables measurement notifications and control point indications
/// - **Keepalive**: polls the sensor status until the first measurement arrives
/// - **Reconnection**: a bounded number of automatic reconnects after a dropped link
///
/// Dropping the client closes the supervisor and releases the link.
///
/// # Examples
///
/// ```no_run
/// use cgmlink::{CgmClient, CgmEvent, SupervisorConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SupervisorConfig {
///         scan_timeout_ms: 30_000,
///         ..Default::default()
///     };
///     let (client, mut events) = CgmClient::with_btleplug(config).await?;
///     client.start_scan()?;
///
///     while let Some(event) = events.recv().await {
///         if let CgmEvent::DeviceFound(device) = event {
///             println!("Found {}", device.display_name());
///             client.connect_to_device(device)?;
///             break;
///         }
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct CgmClient {
    commands: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<LinkStatus>,
    task: Option<JoinHandle<()>>,
}

impl CgmClient {
    /// Start a supervisor on `platform`
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start<P>(
        platform: P,
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CgmEvent>)
    where
        P: BlePlatform + Send + 'static,
    {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor::new(platform, config, events_tx, loop_tx.clone());
        let (status_tx, status_rx) = watch::channel(supervisor.status());
        let task = tokio::spawn(run_event_loop(supervisor, loop_rx, status_tx));

        let client = Self {
            commands: loop_tx,
            status: status_rx,
            task: Some(task),
        };
        (client, events_rx)
    }

    /// Start a supervisor on the system Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn with_btleplug(
        config: SupervisorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CgmEvent>)> {
        let platform = BtleplugPlatform::new().await?;
        Ok(Self::start(platform, config))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(Event::Command(command))
            .map_err(|_| CgmError::ChannelClosed)
    }

    /// Scan for CGM sensors
    ///
    /// Found sensors arrive as [`CgmEvent::DeviceFound`].
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ChannelClosed`] if the client was closed.
    pub fn start_scan(&self) -> Result<()> {
        self.send(Command::StartScan)
    }

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ChannelClosed`] if the client was closed.
    pub fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan)
    }

    /// Connect to a sensor reported by a scan
    ///
    /// Any previous link is released first.
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ChannelClosed`] if the client was closed.
    pub fn connect_to_device(&self, device: DiscoveredDevice) -> Result<()> {
        self.send(Command::Connect(device))
    }

    /// Drop the current link
    ///
    /// Automatic reconnection still applies to the resulting disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ChannelClosed`] if the client was closed.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Release everything and stop the event loop; idempotent
    pub fn close(&self) {
        if self.send(Command::Close).is_err() {
            debug!("Client already closed");
        }
    }

    /// Whether a link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.status.borrow().scanning
    }

    /// Current supervisor state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Latest status snapshot
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Wait until the supervisor reaches `state`
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ChannelClosed`] if the event loop stops first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| CgmError::ChannelClosed)?;
        Ok(())
    }

    /// Close the client and wait for the event loop to finish
    pub async fn closed(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CgmClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Event::Command(Command::Close));
    }
}

async fn run_event_loop<P: BlePlatform>(
    mut supervisor: Supervisor<P>,
    mut events: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<LinkStatus>,
) {
    info!("CGM event loop started");

    while let Some(event) = events.recv().await {
        let running = supervisor.handle(event);
        status.send_replace(supervisor.status());
        if !running {
            break;
        }
    }

    info!("CGM event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_scan_through_client() {
        let (client, mut events) =
            CgmClient::start(MockPlatform::default(), SupervisorConfig::default());
        assert_eq!(client.state(), ConnectionState::Idle);

        client.start_scan().unwrap();
        tokio::time::timeout(WAIT, client.wait_for_state(ConnectionState::Scanning))
            .await
            .unwrap()
            .unwrap();
        assert!(client.is_scanning());
        assert!(!client.is_connected());
        assert_eq!(events.recv().await, Some(CgmEvent::ScanningChanged(true)));

        client.stop_scan().unwrap();
        tokio::time::timeout(WAIT, client.wait_for_state(ConnectionState::Idle))
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_scanning());
    }

    #[tokio::test]
    async fn test_connect_through_client() {
        let platform = MockPlatform::with_bonded("AA:BB:CC:DD:EE:FF");
        let (client, _events) = CgmClient::start(platform, SupervisorConfig::default());

        let device = DiscoveredDevice::new("AA:BB:CC:DD:EE:FF".into(), None, -40);
        client.connect_to_device(device).unwrap();
        tokio::time::timeout(WAIT, client.wait_for_state(ConnectionState::Connecting))
            .await
            .unwrap()
            .unwrap();
        assert!(client.disconnect().is_ok());
    }

    #[tokio::test]
    async fn test_close_stops_event_loop() {
        let (client, mut events) =
            CgmClient::start(MockPlatform::default(), SupervisorConfig::default());
        client.start_scan().unwrap();
        client.close();
        client.close();

        tokio::time::timeout(WAIT, client.closed()).await.unwrap();

        let mut drained = Vec::new();
        while let Some(event) = events.recv().await {
            drained.push(event);
        }
        assert!(drained.contains(&CgmEvent::ScanningChanged(false)));
        assert_eq!(
            drained.last(),
            Some(&CgmEvent::Log("Closed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_commands_fail_after_close() {
        let (mut client, _events) =
            CgmClient::start(MockPlatform::default(), SupervisorConfig::default());
        tokio_test::assert_ok!(client.start_scan());
        client.close();

        let task = client.task.take().unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        let result = tokio_test::assert_err!(client.start_scan());
        assert!(matches!(result, CgmError::ChannelClosed));
        assert!(client.disconnect().is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.close();
    }

    #[tokio::test]
    async fn test_drop_closes_supervisor() {
        let (client, mut events) =
            CgmClient::start(MockPlatform::default(), SupervisorConfig::default());
        drop(client);

        let finished = tokio::time::timeout(WAIT, async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(finished.is_ok());
    }
}
