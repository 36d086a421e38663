use btleplug::api::{BDAddr, CharPropFlags};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{
    error::{CgmError, Result},
    platform::{ConnectionHandle, GattService},
    protocol::{CgmMeasurement, SocpResponse, CCCD_ENABLE_INDICATION, CCCD_ENABLE_NOTIFICATION},
    CGM_FEATURE_UUID, CGM_MEASUREMENT_UUID, CGM_SESSION_RUN_TIME_UUID,
    CGM_SESSION_START_TIME_UUID, CGM_SPECIFIC_OPS_CP_UUID, CGM_STATUS_UUID,
};

/// Placeholder shown for peripherals that do not advertise a name
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// Opaque peripheral identifier as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Wrap a platform identifier
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<BDAddr> for DeviceAddress {
    fn from(value: BDAddr) -> Self {
        Self(value.to_string())
    }
}

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform identifier, the deduplication key
    pub address: DeviceAddress,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl DiscoveredDevice {
    /// Create a new discovered device
    #[must_use]
    pub const fn new(address: DeviceAddress, name: Option<String>, rssi: i16) -> Self {
        Self {
            address,
            name,
            rssi,
        }
    }

    /// Advertised name, or a placeholder when the peripheral has none
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// Connection supervisor states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing designated, never connected
    #[default]
    Idle,
    /// Scan in progress with no link up
    Scanning,
    /// Pairing request outstanding
    Bonding,
    /// Connect request issued, waiting for the link
    Connecting,
    /// Link up, MTU exchange in progress
    MtuNegotiating,
    /// Waiting for GATT discovery
    DiscoveringServices,
    /// Reads and CCCD writes in progress
    SubscribingNotifications,
    /// Measurement notifications enabled
    Ready,
    /// Link lost or closed
    Disconnected,
    /// Waiting for the reconnect delay to elapse
    Reconnecting,
}

impl ConnectionState {
    /// Whether the supervisor may move from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Bonding, Connecting, Disconnected, DiscoveringServices, Idle, MtuNegotiating, Ready,
            Reconnecting, Scanning, SubscribingNotifications,
        };

        if self as u8 == next as u8 {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Scanning | Bonding | Connecting | Disconnected)
                | (Scanning, Idle | Disconnected)
                | (
                    Bonding,
                    Idle | Connecting
                        | DiscoveringServices
                        | SubscribingNotifications
                        | Ready
                        | Disconnected
                )
                | (Connecting | MtuNegotiating | Reconnecting, Disconnected)
                | (Connecting, MtuNegotiating)
                | (MtuNegotiating, DiscoveringServices)
                | (
                    DiscoveringServices,
                    Bonding | SubscribingNotifications | Disconnected
                )
                | (SubscribingNotifications, Bonding | Ready | Disconnected)
                | (Ready, Bonding | Disconnected)
                | (Disconnected, Scanning | Bonding | Connecting | Reconnecting)
                | (Reconnecting, Connecting)
        )
    }

    /// Validate a transition, returning [`CgmError::InvalidTransition`] when refused
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::InvalidTransition`] if `next` is not reachable from `self`.
    pub fn validate_transition(self, next: Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CgmError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Bonding => "Bonding",
            Self::Connecting => "Connecting",
            Self::MtuNegotiating => "MtuNegotiating",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::SubscribingNotifications => "SubscribingNotifications",
            Self::Ready => "Ready",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Progress of a CCCD enable for one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// No enable requested on this link
    #[default]
    NotRequested,
    /// Waiting behind another descriptor write
    Queued,
    /// Descriptor write issued, no completion yet
    WriteInFlight,
    /// Peripheral acknowledged the CCCD write
    Enabled,
    /// Write rejected or timed out
    Failed,
}

/// Delivery mode written to a CCCD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyMode {
    /// Unacknowledged notifications
    Notify,
    /// Acknowledged indications
    Indicate,
}

impl NotifyMode {
    /// Pick the mode a characteristic supports
    ///
    /// Indications are used only when the characteristic indicates but cannot notify.
    #[must_use]
    pub fn for_properties(properties: CharPropFlags) -> Self {
        if properties.contains(CharPropFlags::INDICATE)
            && !properties.contains(CharPropFlags::NOTIFY)
        {
            Self::Indicate
        } else {
            Self::Notify
        }
    }

    /// CCCD value enabling this mode
    #[must_use]
    pub const fn cccd_value(self) -> [u8; 2] {
        match self {
            Self::Notify => CCCD_ENABLE_NOTIFICATION,
            Self::Indicate => CCCD_ENABLE_INDICATION,
        }
    }
}

impl fmt::Display for NotifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify => write!(f, "notify"),
            Self::Indicate => write!(f, "indicate"),
        }
    }
}

/// One characteristic the supervisor wants delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSubscription {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Mode written to the CCCD
    pub mode: NotifyMode,
    /// Current progress
    pub state: SubscriptionState,
    /// Descriptor writes issued for this characteristic on the current link
    pub attempts: u32,
}

impl CharacteristicSubscription {
    /// Create a subscription that has not been requested yet
    #[must_use]
    pub const fn new(uuid: Uuid, mode: NotifyMode) -> Self {
        Self {
            uuid,
            mode,
            state: SubscriptionState::NotRequested,
            attempts: 0,
        }
    }
}

/// A queued CCCD write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWriteJob {
    /// Characteristic owning the CCCD
    pub characteristic: Uuid,
    /// Value to write
    pub value: [u8; 2],
}

/// Characteristics of the CGM service the client knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CgmCharacteristic {
    /// Glucose records (notify)
    Measurement,
    /// Supported features
    Feature,
    /// Sensor status and time offset
    Status,
    /// Session start time
    SessionStartTime,
    /// Session run time
    SessionRunTime,
    /// Specific Ops Control Point (indicate)
    SpecificOpsControlPoint,
}

impl CgmCharacteristic {
    /// Characteristics read once after discovery
    pub const INITIAL_READS: [Self; 4] = [
        Self::Feature,
        Self::Status,
        Self::SessionStartTime,
        Self::SessionRunTime,
    ];

    /// UUID of the characteristic
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Measurement => CGM_MEASUREMENT_UUID,
            Self::Feature => CGM_FEATURE_UUID,
            Self::Status => CGM_STATUS_UUID,
            Self::SessionStartTime => CGM_SESSION_START_TIME_UUID,
            Self::SessionRunTime => CGM_SESSION_RUN_TIME_UUID,
            Self::SpecificOpsControlPoint => CGM_SPECIFIC_OPS_CP_UUID,
        }
    }

    /// Look up a characteristic by UUID
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        [
            Self::Measurement,
            Self::Feature,
            Self::Status,
            Self::SessionStartTime,
            Self::SessionRunTime,
            Self::SpecificOpsControlPoint,
        ]
        .into_iter()
        .find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for CgmCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measurement => write!(f, "CGM Measurement"),
            Self::Feature => write!(f, "CGM Feature"),
            Self::Status => write!(f, "CGM Status"),
            Self::SessionStartTime => write!(f, "CGM Session Start Time"),
            Self::SessionRunTime => write!(f, "CGM Session Run Time"),
            Self::SpecificOpsControlPoint => write!(f, "CGM Specific Ops Control Point"),
        }
    }
}

/// The designated peripheral and everything known about the current link
#[derive(Debug, Clone)]
pub struct PeripheralConnection {
    pub(crate) device: DiscoveredDevice,
    pub(crate) bonding: bool,
    pub(crate) reconnect_attempts: u32,
    pub(crate) handle: Option<ConnectionHandle>,
    pub(crate) connected: bool,
    pub(crate) services_discovered: bool,
    pub(crate) mtu: Option<u16>,
    pub(crate) service: Option<GattService>,
}

impl PeripheralConnection {
    pub(crate) const fn new(device: DiscoveredDevice) -> Self {
        Self {
            device,
            bonding: false,
            reconnect_attempts: 0,
            handle: None,
            connected: false,
            services_discovered: false,
            mtu: None,
            service: None,
        }
    }

    /// Peripheral address
    #[must_use]
    pub const fn address(&self) -> &DeviceAddress {
        &self.device.address
    }

    /// Name shown to users
    #[must_use]
    pub fn name(&self) -> &str {
        self.device.display_name()
    }

    /// Whether a pairing request is outstanding
    #[must_use]
    pub const fn is_bonding(&self) -> bool {
        self.bonding
    }

    /// Automatic reconnects issued since the link was last ready
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Platform handle of the current link
    #[must_use]
    pub const fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    /// Whether the platform reported the link up
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Negotiated ATT MTU, when the platform reported one
    #[must_use]
    pub const fn mtu(&self) -> Option<u16> {
        self.mtu
    }
}

/// Snapshot published after every event the supervisor handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Supervisor state
    pub state: ConnectionState,
    /// Whether a link is up
    pub connected: bool,
    /// Whether a scan is running
    pub scanning: bool,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CgmEvent {
    /// Scan started or stopped
    ScanningChanged(bool),
    /// Link came up or went down
    ConnectionChanged(bool),
    /// New peripheral advertising the CGM service
    DeviceFound(DiscoveredDevice),
    /// Seconds left before the scan times out
    ScanCountdown {
        /// Remaining seconds
        remaining_secs: u32,
    },
    /// Supervisor moved to a new state
    StateChanged(ConnectionState),
    /// Decoded glucose record
    Measurement(CgmMeasurement),
    /// Value read from one of the informational characteristics
    CharacteristicValue {
        /// Which characteristic was read
        characteristic: CgmCharacteristic,
        /// Raw value
        value: Vec<u8>,
    },
    /// Indication received on the Specific Ops Control Point
    ControlPointResponse(SocpResponse),
    /// Human readable progress line
    Log(String),
}

/// Supervisor timing and retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Scan auto-stop in milliseconds
    pub scan_timeout_ms: u64,
    /// Countdown report interval in milliseconds
    pub scan_countdown_interval_ms: u64,
    /// CCCD write acknowledgment timeout in milliseconds
    pub cccd_timeout_ms: u64,
    /// Keepalive read interval in milliseconds
    pub keepalive_interval_ms: u64,
    /// Delay before each automatic reconnect in milliseconds
    pub reconnect_delay_ms: u64,
    /// Automatic reconnects allowed before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before enabling measurement notifications in milliseconds
    pub measurement_enable_delay_ms: u64,
    /// Delay before enabling control point indications in milliseconds
    pub control_point_enable_delay_ms: u64,
    /// Delay before re-requesting a failed CCCD write in milliseconds
    pub cccd_retry_delay_ms: u64,
    /// Delay between control point enable and the interval query in milliseconds
    pub control_point_query_delay_ms: u64,
    /// ATT MTU requested after connecting
    pub preferred_mtu: u16,
}

impl SupervisorConfig {
    pub(crate) const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub(crate) const fn scan_countdown_interval(&self) -> Duration {
        Duration::from_millis(self.scan_countdown_interval_ms)
    }

    pub(crate) const fn cccd_timeout(&self) -> Duration {
        Duration::from_millis(self.cccd_timeout_ms)
    }

    pub(crate) const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub(crate) const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 60_000,
            scan_countdown_interval_ms: 5_000,
            cccd_timeout_ms: 5_000,
            keepalive_interval_ms: 3_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 3,
            measurement_enable_delay_ms: 500,
            control_point_enable_delay_ms: 700,
            cccd_retry_delay_ms: 600,
            control_point_query_delay_ms: 500,
            preferred_mtu: 185,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();

        assert_eq!(config.scan_timeout_ms, 60_000);
        assert_eq!(config.scan_countdown_interval_ms, 5_000);
        assert_eq!(config.cccd_timeout_ms, 5_000);
        assert_eq!(config.keepalive_interval_ms, 3_000);
        assert_eq!(config.reconnect_delay_ms, 2_000);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.measurement_enable_delay_ms, 500);
        assert_eq!(config.control_point_enable_delay_ms, 700);
        assert_eq!(config.preferred_mtu, 185);
        assert_eq!(config.scan_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_notify_mode_selection() {
        assert_eq!(
            NotifyMode::for_properties(CharPropFlags::NOTIFY),
            NotifyMode::Notify
        );
        assert_eq!(
            NotifyMode::for_properties(CharPropFlags::INDICATE),
            NotifyMode::Indicate
        );
        assert_eq!(
            NotifyMode::for_properties(CharPropFlags::INDICATE | CharPropFlags::NOTIFY),
            NotifyMode::Notify
        );
        assert_eq!(
            NotifyMode::for_properties(CharPropFlags::WRITE | CharPropFlags::INDICATE),
            NotifyMode::Indicate
        );
        assert_eq!(NotifyMode::Indicate.cccd_value(), [0x02, 0x00]);
        assert_eq!(NotifyMode::Notify.cccd_value(), [0x01, 0x00]);
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;

        assert!(Idle.can_transition_to(Bonding));
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(MtuNegotiating));
        assert!(DiscoveringServices.can_transition_to(Bonding));
        assert!(Bonding.can_transition_to(SubscribingNotifications));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Ready.can_transition_to(Ready));

        assert!(!Idle.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(DiscoveringServices));
        assert!(!Reconnecting.can_transition_to(Ready));
        assert!(!Scanning.can_transition_to(MtuNegotiating));

        assert!(Idle.validate_transition(Ready).is_err());
        assert!(MtuNegotiating.validate_transition(DiscoveringServices).is_ok());
    }

    #[test]
    fn test_discovered_device_placeholder_name() {
        let named = DiscoveredDevice::new("AA:BB".into(), Some("Sensor".to_string()), -60);
        assert_eq!(named.display_name(), "Sensor");

        let anonymous = DiscoveredDevice::new("AA:BC".into(), None, -70);
        assert_eq!(anonymous.display_name(), UNKNOWN_DEVICE_NAME);
    }

    #[test]
    fn test_characteristic_lookup() {
        assert_eq!(
            CgmCharacteristic::from_uuid(CGM_STATUS_UUID),
            Some(CgmCharacteristic::Status)
        );
        assert_eq!(
            CgmCharacteristic::SpecificOpsControlPoint.uuid(),
            CGM_SPECIFIC_OPS_CP_UUID
        );
        assert_eq!(CgmCharacteristic::from_uuid(crate::CCCD_UUID), None);
    }
}
