use btleplug::api::WriteType;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cccd::DescriptorWriteQueue,
    error::{CgmError, ErrorClass},
    keepalive::KeepaliveMonitor,
    platform::{
        BlePlatform, BondState, ConnectOptions, ConnectionHandle, ConnectionPriority, EventSink,
        GattService, GattStatus, PlatformEvent, GATT_SUCCESS, STATUS_PEER_TERMINATED,
    },
    protocol::{parse_measurement, to_hex, SocpOpCode, SocpResponse},
    scanner::DeviceScanner,
    timer::{TimerKind, TimerToken, Timers},
    types::{
        CgmCharacteristic, CgmEvent, ConnectionState, DescriptorWriteJob, DeviceAddress,
        DiscoveredDevice, LinkStatus, PeripheralConnection, SupervisorConfig,
    },
    CCCD_UUID, CGMS_SERVICE_UUID, CGM_MEASUREMENT_UUID, CGM_SPECIFIC_OPS_CP_UUID,
    CGM_STATUS_UUID,
};

/// Characteristics the supervisor subscribes to, in enable order
const SUBSCRIBED: [Uuid; 2] = [CGM_MEASUREMENT_UUID, CGM_SPECIFIC_OPS_CP_UUID];

/// Application request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start scanning for CGM peripherals
    StartScan,
    /// Stop scanning
    StopScan,
    /// Designate a peripheral and connect to it
    Connect(DiscoveredDevice),
    /// Drop the current link
    Disconnect,
    /// Release everything and stop the event loop
    Close,
}

/// Everything the event loop delivers to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Request from the application
    Command(Command),
    /// Callback from the platform BLE stack
    Platform(PlatformEvent),
    /// A scheduled task fired
    Timer(TimerToken),
}

/// The connection state machine
///
/// Owns the designated peripheral and drives it through scanning, bonding, MTU
/// negotiation, service discovery, notification subscription and
/// reconnection. It is fed one [`Event`] at a time by the event loop in
/// [`crate::device`]; platform callbacks, timer expiries and application
/// commands all arrive through the same queue, so no state here is ever
/// touched concurrently.
#[derive(Debug)]
pub struct Supervisor<P: BlePlatform> {
    platform: P,
    config: SupervisorConfig,
    timers: Timers,
    scanner: DeviceScanner,
    queue: DescriptorWriteQueue,
    keepalive: KeepaliveMonitor,
    state: ConnectionState,
    bond_resume: ConnectionState,
    connection: Option<PeripheralConnection>,
    events: mpsc::UnboundedSender<CgmEvent>,
    closed: bool,
}

impl<P: BlePlatform> Supervisor<P> {
    /// Create a supervisor
    ///
    /// `events` receives everything surfaced to the application. `loopback` is
    /// the sender side of the event loop queue; platform callbacks and timers
    /// push into it.
    pub fn new(
        mut platform: P,
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<CgmEvent>,
        loopback: mpsc::UnboundedSender<Event>,
    ) -> Self {
        platform.attach(EventSink::new(loopback.clone()));

        Self {
            platform,
            config,
            timers: Timers::new(loopback),
            scanner: DeviceScanner::new(),
            queue: DescriptorWriteQueue::new(),
            keepalive: KeepaliveMonitor::new(),
            state: ConnectionState::Idle,
            bond_resume: ConnectionState::Idle,
            connection: None,
            events,
            closed: false,
        }
    }

    /// Handle one event; returns `false` once the supervisor is closed
    pub fn handle(&mut self, event: Event) -> bool {
        if self.closed {
            return false;
        }

        match event {
            Event::Command(command) => self.handle_command(command),
            Event::Platform(event) => self.handle_platform(event),
            Event::Timer(token) => {
                if self.timers.claim(token) {
                    self.handle_timer(token.kind);
                }
            }
        }

        !self.closed
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan => self.start_scan(),
            Command::StopScan => self.stop_scan(),
            Command::Connect(device) => self.connect(device),
            Command::Disconnect => self.disconnect(),
            Command::Close => self.close(),
        }
    }

    fn handle_platform(&mut self, event: PlatformEvent) {
        if let Some(handle) = event.handle() {
            if !self.is_current(handle) {
                debug!("Ignoring event for stale link {}", handle);
                return;
            }
        }

        match event {
            PlatformEvent::ScanResult {
                address,
                name,
                rssi,
            } => self.on_scan_result(address, name, rssi),
            PlatformEvent::ScanFailed { reason } => {
                self.log_warn(format!("Scan failed: {reason}"));
                self.stop_scan();
            }
            PlatformEvent::ConnectionStateChanged {
                handle,
                status,
                connected,
            } => {
                if connected && status == GATT_SUCCESS {
                    self.on_connected(handle);
                } else {
                    self.on_link_lost(handle, status);
                }
            }
            PlatformEvent::MtuChanged {
                handle,
                mtu,
                success,
            } => self.on_mtu_changed(handle, mtu, success),
            PlatformEvent::ServicesDiscovered {
                handle,
                success,
                services,
            } => self.on_services_discovered(handle, success, services),
            PlatformEvent::CharacteristicRead {
                characteristic,
                value,
                success,
                ..
            } => self.on_characteristic_read(characteristic, value, success),
            PlatformEvent::CharacteristicWritten {
                characteristic,
                value,
                success,
                ..
            } => {
                if characteristic == CGM_SPECIFIC_OPS_CP_UUID {
                    let frame = to_hex(&value);
                    if success {
                        self.log_info(format!("Control point write [{frame}] accepted"));
                    } else {
                        self.log_warn(format!("Control point write [{frame}] failed"));
                    }
                }
            }
            PlatformEvent::DescriptorWritten {
                characteristic,
                descriptor,
                success,
                ..
            } => self.on_descriptor_written(characteristic, descriptor, success),
            PlatformEvent::CharacteristicChanged {
                characteristic,
                value,
                ..
            } => self.on_characteristic_changed(characteristic, &value),
            PlatformEvent::BondStateChanged { address, state } => {
                self.on_bond_state(&address, state);
            }
        }
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanTimeout => {
                self.log_info("Scan timed out".to_string());
                self.stop_scan();
            }
            TimerKind::ScanCountdown => {
                let interval = whole_secs(self.config.scan_countdown_interval_ms);
                if let Some(remaining_secs) = self.scanner.tick(interval) {
                    debug!("Scan ends in {}s", remaining_secs);
                    self.emit(CgmEvent::ScanCountdown { remaining_secs });
                    self.timers
                        .schedule(TimerKind::ScanCountdown, self.config.scan_countdown_interval());
                }
            }
            TimerKind::DescriptorWriteTimeout => {
                let error = CgmError::Timeout {
                    timeout_ms: self.config.cccd_timeout_ms,
                };
                if let Some(uuid) = self.queue.in_flight() {
                    self.log_warn(format!("{} CCCD write: {error}", characteristic_name(uuid)));
                }
                if let Some(job) = self.queue.on_timeout() {
                    self.issue_write(job);
                }
            }
            TimerKind::Keepalive => self.on_keepalive(),
            TimerKind::Reconnect => {
                let Some(connection) = &self.connection else {
                    return;
                };
                if connection.handle.is_some() {
                    debug!("Link already in flight, skipping reconnect");
                    return;
                }
                self.log_info(format!("Reconnecting to {}", connection.name()));
                self.open_connection();
            }
            TimerKind::EnableNotifications(uuid) => {
                let discovered = self
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.services_discovered && c.handle.is_some());
                if discovered {
                    self.enable_notifications(uuid);
                }
            }
            TimerKind::ControlPointQuery => {
                let Some(handle) = self.current_handle() else {
                    return;
                };
                debug!("Requesting CGM communication interval");
                if let Err(e) = self.platform.write_characteristic(
                    handle,
                    CGM_SPECIFIC_OPS_CP_UUID,
                    &SocpOpCode::GetCommunicationInterval.request(),
                    WriteType::WithResponse,
                ) {
                    debug!("Communication interval request not sent: {}", e);
                }
            }
        }
    }

    /// Start a scan for CGM peripherals
    pub fn start_scan(&mut self) {
        if !self.platform.adapter_available() {
            self.log_warn(CgmError::AdapterUnavailable.to_string());
            return;
        }
        if self.scanner.is_scanning() {
            self.log_info("Scan already running".to_string());
            return;
        }
        if let Err(e) = self.platform.start_scan(CGMS_SERVICE_UUID) {
            self.log_warn(format!("Unable to start scan: {e}"));
            return;
        }

        let total_secs = whole_secs(self.config.scan_timeout_ms);
        self.scanner.begin(total_secs);
        self.emit(CgmEvent::ScanningChanged(true));
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            self.transition(ConnectionState::Scanning);
        }

        self.timers
            .schedule(TimerKind::ScanTimeout, self.config.scan_timeout());
        self.timers
            .schedule(TimerKind::ScanCountdown, self.config.scan_countdown_interval());
        self.log_info(format!("Scanning for CGM sensors ({total_secs}s)"));
    }

    /// Stop the running scan; no-op when none runs
    pub fn stop_scan(&mut self) {
        self.timers.cancel(TimerKind::ScanTimeout);
        self.timers.cancel(TimerKind::ScanCountdown);

        if !self.scanner.end() {
            return;
        }

        self.platform.stop_scan();
        self.emit(CgmEvent::ScanningChanged(false));
        if self.state == ConnectionState::Scanning {
            let next = if self.connection.is_some() {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Idle
            };
            self.transition(next);
        }
        self.log_info("Scan stopped".to_string());
    }

    fn on_scan_result(&mut self, address: DeviceAddress, name: Option<String>, rssi: i16) {
        if let Some(device) = self.scanner.observe(address, name, rssi) {
            self.log_info(format!(
                "Found {} ({}) at {} dBm",
                device.display_name(),
                device.address,
                device.rssi
            ));
            self.emit(CgmEvent::DeviceFound(device));
        }
    }

    /// Designate a peripheral and connect to it, pairing first when needed
    pub fn connect(&mut self, device: DiscoveredDevice) {
        self.stop_scan();
        self.release_link();

        let address = device.address.clone();
        self.log_info(format!("Selected {} ({})", device.display_name(), address));
        self.connection = Some(PeripheralConnection::new(device));
        self.keepalive.reset();

        if self.is_bonded(&address) {
            self.open_connection();
        } else if !self.request_bond() {
            self.log_info("Connecting without pairing".to_string());
            self.open_connection();
        }
    }

    /// Ask the platform to drop the current link
    pub fn disconnect(&mut self) {
        match self.current_handle() {
            Some(handle) => {
                self.log_info("Disconnecting".to_string());
                self.platform.disconnect(handle);
            }
            None => debug!("Disconnect requested without a link"),
        }
    }

    /// Release every resource and stop accepting events; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.timers.cancel_all();
        if self.scanner.end() {
            self.platform.stop_scan();
            self.emit(CgmEvent::ScanningChanged(false));
        }
        if let Some(connection) = self.connection.take() {
            if let Some(handle) = connection.handle {
                self.platform.disconnect(handle);
                self.platform.close(handle);
            }
        }
        self.emit(CgmEvent::ConnectionChanged(false));
        self.queue.clear();
        self.keepalive.reset();
        self.platform.unregister_bond_listener();

        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.emit(CgmEvent::StateChanged(ConnectionState::Disconnected));
        }
        self.log_info("Closed".to_string());
        self.closed = true;
    }

    fn open_connection(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.handle.is_some() {
            debug!("Link already in flight");
            return;
        }

        let address = connection.address().clone();
        match self.platform.connect(&address, ConnectOptions::default()) {
            Ok(handle) => {
                connection.handle = Some(handle);
                info!("Connecting to {} on link {}", address, handle);
                self.transition(ConnectionState::Connecting);
            }
            Err(e) => {
                self.log_warn(format!("Connect request failed: {e}"));
                self.transition(ConnectionState::Disconnected);
                if e.is_recoverable() {
                    self.schedule_reconnect_if_needed();
                } else {
                    self.log_warn("Not reconnecting until a new connect request".to_string());
                }
            }
        }
    }

    /// Drop whatever link exists before designating a new peripheral
    fn release_link(&mut self) {
        self.cancel_link_timers();
        self.timers.cancel(TimerKind::Reconnect);
        self.keepalive.cancel();
        self.queue.clear();

        if let Some(connection) = self.connection.take() {
            if let Some(handle) = connection.handle {
                self.platform.disconnect(handle);
                self.platform.close(handle);
            }
            if connection.connected {
                self.emit(CgmEvent::ConnectionChanged(false));
            }
        }

        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn on_connected(&mut self, handle: ConnectionHandle) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        connection.connected = true;
        connection.bonding = false;
        connection.services_discovered = false;
        connection.mtu = None;
        let name = connection.name().to_string();

        self.transition(ConnectionState::MtuNegotiating);
        self.emit(CgmEvent::ConnectionChanged(true));
        self.log_info(format!("Connected to {name}"));

        self.keepalive.reset();
        self.queue.reset();

        if let Err(e) = self
            .platform
            .request_connection_priority(handle, ConnectionPriority::High)
        {
            debug!("Connection priority not changed: {}", e);
        }

        match self.platform.request_mtu(handle, self.config.preferred_mtu) {
            Ok(()) => debug!("Requested MTU {}", self.config.preferred_mtu),
            Err(e) => {
                debug!("MTU request refused: {}", e);
                self.start_discovery(handle);
            }
        }
    }

    fn on_mtu_changed(&mut self, handle: ConnectionHandle, mtu: u16, success: bool) {
        if success {
            if let Some(connection) = self.connection.as_mut() {
                connection.mtu = Some(mtu);
            }
            self.log_info(format!("MTU set to {mtu}"));
        } else {
            self.log_warn("MTU negotiation failed, continuing with default".to_string());
        }

        if self.state == ConnectionState::MtuNegotiating {
            self.start_discovery(handle);
        }
    }

    fn start_discovery(&mut self, handle: ConnectionHandle) {
        self.transition(ConnectionState::DiscoveringServices);
        if let Err(e) = self.platform.discover_services(handle) {
            self.log_warn(format!("Service discovery could not start: {e}"));
            // the disconnect event drives reconnection
            if e.class() == ErrorClass::ConnectionLoss {
                self.platform.disconnect(handle);
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        handle: ConnectionHandle,
        success: bool,
        services: Vec<GattService>,
    ) {
        if !success {
            self.log_warn("Service discovery failed".to_string());
            return;
        }

        let Some(service) = services.into_iter().find(|s| s.uuid == CGMS_SERVICE_UUID) else {
            self.log_warn(CgmError::ServiceNotFound(CGMS_SERVICE_UUID).to_string());
            return;
        };

        self.register_subscriptions(&service);

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        connection.services_discovered = true;
        connection.service = Some(service);
        let bonding = connection.bonding;
        let address = connection.address().clone();
        self.log_info("CGM service discovered".to_string());

        if !bonding && !self.is_bonded(&address) && self.request_bond() {
            return;
        }
        self.continue_subscriptions(handle, true);
    }

    fn register_subscriptions(&mut self, service: &GattService) {
        for uuid in SUBSCRIBED {
            match service.characteristic(uuid) {
                None => self.log_warn(CgmError::CharacteristicNotFound(uuid).to_string()),
                Some(characteristic) if !characteristic.has_cccd() => {
                    let present = characteristic
                        .descriptors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    let error = CgmError::DescriptorNotFound {
                        characteristic: uuid,
                        descriptor: CCCD_UUID,
                    };
                    self.log_warn(format!("{error} (present: [{present}])"));
                }
                Some(characteristic) => self.queue.register(uuid, characteristic.properties),
            }
        }
    }

    /// Reads, notification enables and keepalive once the link is usable
    fn continue_subscriptions(&mut self, handle: ConnectionHandle, delayed: bool) {
        self.transition(ConnectionState::SubscribingNotifications);

        let service = self.connection.as_ref().and_then(|c| c.service.clone());
        if let Some(service) = service {
            for characteristic in CgmCharacteristic::INITIAL_READS {
                if service.characteristic(characteristic.uuid()).is_none() {
                    continue;
                }
                if let Err(e) = self
                    .platform
                    .read_characteristic(handle, characteristic.uuid())
                {
                    debug!("Read of {} not issued: {}", characteristic, e);
                }
            }
        }

        if delayed {
            self.timers.schedule(
                TimerKind::EnableNotifications(CGM_MEASUREMENT_UUID),
                Duration::from_millis(self.config.measurement_enable_delay_ms),
            );
            self.timers.schedule(
                TimerKind::EnableNotifications(CGM_SPECIFIC_OPS_CP_UUID),
                Duration::from_millis(self.config.control_point_enable_delay_ms),
            );
        } else {
            for uuid in SUBSCRIBED {
                self.enable_notifications(uuid);
            }
        }

        if self.keepalive.start() {
            self.timers
                .schedule(TimerKind::Keepalive, self.config.keepalive_interval());
        }

        self.check_ready();
    }

    fn enable_notifications(&mut self, uuid: Uuid) {
        if let Some(job) = self.queue.request_enable(uuid) {
            self.issue_write(job);
        }
    }

    fn issue_write(&mut self, job: DescriptorWriteJob) {
        let name = characteristic_name(job.characteristic);
        let Some(handle) = self.current_handle() else {
            debug!("CCCD write on {} dropped: {}", name, CgmError::NotConnected);
            self.queue.reset();
            return;
        };

        self.timers
            .schedule(TimerKind::DescriptorWriteTimeout, self.config.cccd_timeout());
        if let Err(e) = self
            .platform
            .set_notification(handle, job.characteristic, true)
        {
            debug!("Local notification enable for {} failed: {}", name, e);
        }

        match self
            .platform
            .write_descriptor(handle, job.characteristic, CCCD_UUID, &job.value)
        {
            Ok(()) => debug!("Writing CCCD {} on {}", to_hex(&job.value), name),
            Err(e) => {
                self.log_warn(format!("CCCD write on {name} not issued: {e}"));
                self.timers.cancel(TimerKind::DescriptorWriteTimeout);
                if let Some(next) = self.queue.complete(job.characteristic, false) {
                    self.issue_write(next);
                }
            }
        }
    }

    fn on_descriptor_written(&mut self, characteristic: Uuid, descriptor: Uuid, success: bool) {
        if descriptor != CCCD_UUID {
            debug!("Descriptor {} written on {}", descriptor, characteristic);
            return;
        }

        if self.queue.in_flight() == Some(characteristic) {
            self.timers.cancel(TimerKind::DescriptorWriteTimeout);
        }
        let next = self.queue.complete(characteristic, success);
        let name = characteristic_name(characteristic);

        if success {
            self.log_info(format!("{name} notifications enabled"));
            if characteristic == CGM_SPECIFIC_OPS_CP_UUID {
                self.timers.schedule(
                    TimerKind::ControlPointQuery,
                    Duration::from_millis(self.config.control_point_query_delay_ms),
                );
            } else if characteristic == CGM_MEASUREMENT_UUID {
                self.check_ready();
            }
        } else {
            self.log_warn(format!("{name} CCCD write failed"));
            self.on_descriptor_failure(characteristic);
        }

        if let Some(job) = next {
            self.issue_write(job);
        }
    }

    fn on_descriptor_failure(&mut self, characteristic: Uuid) {
        let Some(connection) = &self.connection else {
            return;
        };
        let bonding = connection.bonding;
        let discovered = connection.services_discovered;
        let address = connection.address().clone();

        if !bonding && !self.is_bonded(&address) && self.request_bond() {
            return;
        }

        if discovered && self.queue.can_retry(characteristic) {
            let attempts = self
                .queue
                .subscription(characteristic)
                .map_or(0, |s| s.attempts);
            debug!(
                "Retrying CCCD write on {} in {}ms (attempt {})",
                characteristic,
                self.config.cccd_retry_delay_ms,
                attempts + 1
            );
            self.timers.schedule(
                TimerKind::EnableNotifications(characteristic),
                Duration::from_millis(self.config.cccd_retry_delay_ms),
            );
        } else if !self.queue.is_enabled(characteristic) {
            self.log_warn(format!(
                "Not retrying {} notifications",
                characteristic_name(characteristic)
            ));
        }
    }

    fn check_ready(&mut self) {
        if self.state != ConnectionState::SubscribingNotifications
            || !self.queue.is_enabled(CGM_MEASUREMENT_UUID)
        {
            return;
        }
        if self.transition(ConnectionState::Ready) {
            if let Some(connection) = self.connection.as_mut() {
                connection.reconnect_attempts = 0;
            }
            self.log_info("Receiving CGM measurements".to_string());
        }
    }

    fn on_keepalive(&mut self) {
        let (connected, handle) = self
            .connection
            .as_ref()
            .map_or((false, None), |c| (c.connected, c.handle));

        if !self.keepalive.should_poll(connected, handle.is_some()) {
            debug!("Keepalive stopped");
            return;
        }
        if let Some(handle) = handle {
            if let Err(e) = self.platform.read_characteristic(handle, CGM_STATUS_UUID) {
                debug!("Keepalive read not issued: {}", e);
            }
        }
        self.timers
            .schedule(TimerKind::Keepalive, self.config.keepalive_interval());
    }

    fn on_characteristic_read(&mut self, uuid: Uuid, value: Vec<u8>, success: bool) {
        if !success {
            debug!("Read of {} failed", characteristic_name(uuid));
            return;
        }
        match CgmCharacteristic::from_uuid(uuid) {
            Some(characteristic) => {
                self.log_info(format!("{characteristic}: {}", to_hex(&value)));
                self.emit(CgmEvent::CharacteristicValue {
                    characteristic,
                    value,
                });
            }
            None => debug!("Read {} from {}", to_hex(&value), uuid),
        }
    }

    fn on_characteristic_changed(&mut self, uuid: Uuid, value: &[u8]) {
        if uuid == CGM_MEASUREMENT_UUID {
            let measurement = parse_measurement(value);
            if self.keepalive.record_measurement() {
                self.timers.cancel(TimerKind::Keepalive);
                debug!("First measurement received, keepalive cancelled");
            }
            self.log_info(format!("Measurement: {measurement}"));
            self.emit(CgmEvent::Measurement(measurement));
        } else if uuid == CGM_SPECIFIC_OPS_CP_UUID {
            match SocpResponse::parse(value) {
                Ok(response) => {
                    self.log_info(format!("Control point: {response}"));
                    self.emit(CgmEvent::ControlPointResponse(response));
                }
                Err(e) => debug!("Ignoring control point frame: {}", e),
            }
        } else {
            debug!("Notification from {}: {}", uuid, to_hex(value));
        }
    }

    fn on_link_lost(&mut self, handle: ConnectionHandle, status: GattStatus) {
        match status {
            STATUS_PEER_TERMINATED => self.log_warn(format!(
                "Peripheral terminated the link (status 0x{status:02X})"
            )),
            GATT_SUCCESS => self.log_info("Disconnected".to_string()),
            _ => self.log_warn(format!("Link lost (status 0x{status:02X})")),
        }

        if let Some(connection) = self.connection.as_mut() {
            connection.handle = None;
            connection.connected = false;
            connection.services_discovered = false;
            connection.mtu = None;
        }
        self.platform.close(handle);
        self.emit(CgmEvent::ConnectionChanged(false));

        self.keepalive.cancel();
        self.cancel_link_timers();
        self.queue.reset();

        self.transition(ConnectionState::Disconnected);
        self.schedule_reconnect_if_needed();
    }

    fn schedule_reconnect_if_needed(&mut self) {
        let max = self.config.max_reconnect_attempts;
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.handle.is_some() {
            return;
        }
        if connection.reconnect_attempts >= max {
            self.log_warn(format!("Giving up after {max} reconnect attempts"));
            return;
        }

        connection.reconnect_attempts += 1;
        let attempt = connection.reconnect_attempts;
        self.transition(ConnectionState::Reconnecting);
        self.timers
            .schedule(TimerKind::Reconnect, self.config.reconnect_delay());
        self.log_info(format!(
            "Reconnect {attempt}/{max} in {}ms",
            self.config.reconnect_delay_ms
        ));
    }

    fn on_bond_state(&mut self, address: &DeviceAddress, bond: BondState) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.address() != address {
            debug!("Bond state of {} changed to {}", address, bond);
            return;
        }

        match bond {
            BondState::Bonding => debug!("Pairing with {} in progress", address),
            BondState::Bonded => {
                if !connection.bonding && self.state != ConnectionState::Bonding {
                    debug!("{} paired outside of a pairing request", address);
                    return;
                }
                connection.bonding = false;
                let handle = connection.handle;
                let discovered = connection.services_discovered;
                self.log_info(format!("Paired with {address}"));

                match handle {
                    None => self.open_connection(),
                    Some(handle) if discovered => self.continue_subscriptions(handle, false),
                    Some(handle) => self.start_discovery(handle),
                }
            }
            BondState::None => {
                if !connection.bonding {
                    return;
                }
                connection.bonding = false;
                let fallback = if connection.handle.is_some() {
                    self.bond_resume
                } else {
                    ConnectionState::Idle
                };
                self.log_warn(format!("Pairing with {address} failed"));
                self.transition(fallback);
            }
        }
    }

    /// Ask the platform to pair with the designated peripheral
    fn request_bond(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        let address = connection.address().clone();

        match self.platform.create_bond(&address) {
            Ok(()) => {
                connection.bonding = true;
                self.bond_resume = self.state;
                self.transition(ConnectionState::Bonding);
                self.log_info(format!("Pairing with {address}"));
                true
            }
            Err(e) => {
                self.log_warn(format!("Pairing request refused: {e}"));
                false
            }
        }
    }

    fn cancel_link_timers(&mut self) {
        self.timers.cancel_where(|kind| {
            matches!(
                kind,
                TimerKind::DescriptorWriteTimeout
                    | TimerKind::Keepalive
                    | TimerKind::EnableNotifications(_)
                    | TimerKind::ControlPointQuery
            )
        });
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }
        match self.state.validate_transition(next) {
            Ok(()) => {
                debug!("{} -> {}", self.state, next);
                self.state = next;
                self.emit(CgmEvent::StateChanged(next));
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn is_bonded(&self, address: &DeviceAddress) -> bool {
        self.platform.bond_state(address) == BondState::Bonded
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        self.connection.as_ref().and_then(|c| c.handle)
    }

    fn is_current(&self, handle: ConnectionHandle) -> bool {
        self.current_handle() == Some(handle)
    }

    fn emit(&self, event: CgmEvent) {
        let _ = self.events.send(event);
    }

    fn log_info(&self, message: String) {
        info!("{}", message);
        self.emit(CgmEvent::Log(message));
    }

    fn log_warn(&self, message: String) {
        warn!("{}", message);
        self.emit(CgmEvent::Log(message));
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.connected)
    }

    /// Whether a scan is running
    #[must_use]
    pub const fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Whether [`Supervisor::close`] ran
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Snapshot for the status channel
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            connected: self.is_connected(),
            scanning: self.is_scanning(),
        }
    }

    /// The designated peripheral
    #[must_use]
    pub const fn connection(&self) -> Option<&PeripheralConnection> {
        self.connection.as_ref()
    }

    /// The platform backend
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[cfg(test)]
    pub(crate) fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    #[cfg(test)]
    pub(crate) const fn timers(&self) -> &Timers {
        &self.timers
    }

    #[cfg(test)]
    pub(crate) const fn queue(&self) -> &DescriptorWriteQueue {
        &self.queue
    }
}

fn characteristic_name(uuid: Uuid) -> String {
    CgmCharacteristic::from_uuid(uuid).map_or_else(|| uuid.to_string(), |c| c.to_string())
}

fn whole_secs(ms: u64) -> u32 {
    u32::try_from(ms / 1000).unwrap_or(u32::MAX)
}
