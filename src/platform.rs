use btleplug::api::{CharPropFlags, WriteType};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Result, supervisor::Event, types::DeviceAddress, CCCD_UUID};

/// GATT status reported with platform callbacks
pub type GattStatus = u8;

/// Operation completed
pub const GATT_SUCCESS: GattStatus = 0x00;

/// Remote side terminated the link (security, multi-connection or idle policy)
pub const STATUS_PEER_TERMINATED: GattStatus = 0x13;

/// Unspecified stack failure
pub const GATT_ERROR: GattStatus = 0x85;

/// Identifies one platform link
///
/// Every link gets a fresh handle, so events tagged with an older handle can be
/// recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Wrap a raw handle value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw handle value
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pairing state of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    /// Not paired, or pairing failed
    None,
    /// Pairing in progress
    Bonding,
    /// Paired
    Bonded,
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bonding => write!(f, "bonding"),
            Self::Bonded => write!(f, "bonded"),
        }
    }
}

/// Connection interval preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    /// Short connection interval, used while setting up the link
    High,
}

/// Physical transport for a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Low Energy only
    Le,
}

/// Options for [`BlePlatform::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Transport to use
    pub transport: Transport,
    /// Let the platform connect whenever the peripheral shows up
    pub auto_connect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Le,
            auto_connect: false,
        }
    }
}

/// A characteristic found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Advertised properties
    pub properties: CharPropFlags,
    /// UUIDs of the descriptors present
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Whether the characteristic carries a Client Characteristic Configuration descriptor
    #[must_use]
    pub fn has_cccd(&self) -> bool {
        self.descriptors.contains(&CCCD_UUID)
    }
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of the service
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Look up a characteristic of this service
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Callbacks from the platform BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A peripheral advertising the filtered service was seen
    ScanResult {
        /// Peripheral address
        address: DeviceAddress,
        /// Advertised local name
        name: Option<String>,
        /// Signal strength in dBm
        rssi: i16,
    },
    /// The running scan failed
    ScanFailed {
        /// Platform description of the failure
        reason: String,
    },
    /// A link came up or went down
    ConnectionStateChanged {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// GATT status
        status: GattStatus,
        /// Whether the link is up
        connected: bool,
    },
    /// MTU exchange finished
    MtuChanged {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Negotiated MTU
        mtu: u16,
        /// Whether the exchange succeeded
        success: bool,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Whether discovery succeeded
        success: bool,
        /// Discovered services
        services: Vec<GattService>,
    },
    /// A characteristic read finished
    CharacteristicRead {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Characteristic read
        characteristic: Uuid,
        /// Value read
        value: Vec<u8>,
        /// Whether the read succeeded
        success: bool,
    },
    /// A characteristic write finished
    CharacteristicWritten {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Characteristic written
        characteristic: Uuid,
        /// Value written
        value: Vec<u8>,
        /// Whether the write succeeded
        success: bool,
    },
    /// A descriptor write finished
    DescriptorWritten {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Characteristic owning the descriptor
        characteristic: Uuid,
        /// Descriptor written
        descriptor: Uuid,
        /// Whether the write succeeded
        success: bool,
    },
    /// Notification or indication received
    CharacteristicChanged {
        /// Link the event belongs to
        handle: ConnectionHandle,
        /// Characteristic that changed
        characteristic: Uuid,
        /// New value
        value: Vec<u8>,
    },
    /// Pairing state of a peripheral changed
    BondStateChanged {
        /// Peripheral address
        address: DeviceAddress,
        /// New state
        state: BondState,
    },
}

impl PlatformEvent {
    /// Link the event is tagged with, if any
    #[must_use]
    pub const fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Self::ConnectionStateChanged { handle, .. }
            | Self::MtuChanged { handle, .. }
            | Self::ServicesDiscovered { handle, .. }
            | Self::CharacteristicRead { handle, .. }
            | Self::CharacteristicWritten { handle, .. }
            | Self::DescriptorWritten { handle, .. }
            | Self::CharacteristicChanged { handle, .. } => Some(*handle),
            Self::ScanResult { .. } | Self::ScanFailed { .. } | Self::BondStateChanged { .. } => {
                None
            }
        }
    }
}

/// Delivers platform callbacks into the supervisor event loop
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) const fn new(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self { sender }
    }

    /// Queue a callback; returns `false` once the event loop has shut down
    pub fn emit(&self, event: PlatformEvent) -> bool {
        self.sender.send(Event::Platform(event)).is_ok()
    }

    /// Whether the event loop has shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The platform BLE stack, as seen by the supervisor
///
/// Commands never block. They return once the request has been handed to the
/// stack; the outcome arrives later as a [`PlatformEvent`] through the
/// [`EventSink`] passed to [`BlePlatform::attach`]. An `Err` means the request
/// was refused outright and no event will follow.
pub trait BlePlatform {
    /// Register the sink callbacks are delivered to
    fn attach(&mut self, sink: EventSink);

    /// Whether an adapter is present and powered
    fn adapter_available(&self) -> bool;

    /// Start a low-latency scan filtered to `service`
    ///
    /// # Errors
    ///
    /// Returns [`crate::CgmError::ScanUnavailable`] when the scanner cannot be started.
    fn start_scan(&mut self, service: Uuid) -> Result<()>;

    /// Stop the running scan, if any
    fn stop_scan(&mut self);

    /// Open a link to `address`
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn connect(&mut self, address: &DeviceAddress, options: ConnectOptions)
        -> Result<ConnectionHandle>;

    /// Ask the stack to drop the link; a disconnect event follows
    fn disconnect(&mut self, handle: ConnectionHandle);

    /// Release every resource held for the link; no further events follow
    fn close(&mut self, handle: ConnectionHandle);

    /// Request a connection interval preference
    ///
    /// # Errors
    ///
    /// Returns [`crate::CgmError::Unsupported`] when the stack has no such control.
    fn request_connection_priority(
        &mut self,
        handle: ConnectionHandle,
        priority: ConnectionPriority,
    ) -> Result<()>;

    /// Request an ATT MTU exchange
    ///
    /// # Errors
    ///
    /// Returns [`crate::CgmError::Unsupported`] when the stack has no such control.
    fn request_mtu(&mut self, handle: ConnectionHandle, mtu: u16) -> Result<()>;

    /// Start GATT service discovery
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn discover_services(&mut self, handle: ConnectionHandle) -> Result<()>;

    /// Read a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn read_characteristic(&mut self, handle: ConnectionHandle, characteristic: Uuid)
        -> Result<()>;

    /// Write a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn write_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Write a descriptor of a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn write_descriptor(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Enable or disable local delivery of notifications for a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be issued.
    fn set_notification(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()>;

    /// Current pairing state of a peripheral
    fn bond_state(&self, address: &DeviceAddress) -> BondState;

    /// Start pairing; the outcome arrives as [`PlatformEvent::BondStateChanged`]
    ///
    /// # Errors
    ///
    /// Returns [`crate::CgmError::Bonding`] when the request is refused.
    fn create_bond(&mut self, address: &DeviceAddress) -> Result<()>;

    /// Stop delivering bond state changes
    fn unregister_bond_listener(&mut self);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::CgmError;
    use std::collections::HashSet;

    /// Platform request recorded by [`MockPlatform`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PlatformCall {
        StartScan(Uuid),
        StopScan,
        Connect(DeviceAddress, ConnectOptions),
        Disconnect(ConnectionHandle),
        Close(ConnectionHandle),
        RequestPriority(ConnectionHandle, ConnectionPriority),
        RequestMtu(ConnectionHandle, u16),
        DiscoverServices(ConnectionHandle),
        Read(ConnectionHandle, Uuid),
        Write(ConnectionHandle, Uuid, Vec<u8>),
        WriteDescriptor(ConnectionHandle, Uuid, Uuid, Vec<u8>),
        SetNotification(ConnectionHandle, Uuid, bool),
        CreateBond(DeviceAddress),
        UnregisterBondListener,
    }

    /// Recording platform; tests inject callbacks through the supervisor directly
    #[derive(Debug)]
    pub struct MockPlatform {
        pub calls: Vec<PlatformCall>,
        pub adapter_enabled: bool,
        pub scan_fails: bool,
        pub connect_fails: bool,
        pub mtu_refused: bool,
        pub discovery_refused: bool,
        pub bond_refused: bool,
        pub bonded: HashSet<DeviceAddress>,
        pub attached: bool,
        next_handle: u64,
    }

    impl Default for MockPlatform {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                adapter_enabled: true,
                scan_fails: false,
                connect_fails: false,
                mtu_refused: false,
                discovery_refused: false,
                bond_refused: false,
                bonded: HashSet::new(),
                attached: false,
                next_handle: 1,
            }
        }
    }

    impl MockPlatform {
        pub fn with_bonded(address: &str) -> Self {
            let mut platform = Self::default();
            platform.bonded.insert(DeviceAddress::from(address));
            platform
        }

        pub fn count(&self, predicate: impl Fn(&PlatformCall) -> bool) -> usize {
            self.calls.iter().filter(|c| predicate(c)).count()
        }

        pub fn position(&self, predicate: impl Fn(&PlatformCall) -> bool) -> Option<usize> {
            self.calls.iter().position(predicate)
        }
    }

    impl BlePlatform for MockPlatform {
        fn attach(&mut self, _sink: EventSink) {
            self.attached = true;
        }

        fn adapter_available(&self) -> bool {
            self.adapter_enabled
        }

        fn start_scan(&mut self, service: Uuid) -> Result<()> {
            if self.scan_fails {
                return Err(CgmError::ScanUnavailable("scanner missing".to_string()));
            }
            self.calls.push(PlatformCall::StartScan(service));
            Ok(())
        }

        fn stop_scan(&mut self) {
            self.calls.push(PlatformCall::StopScan);
        }

        fn connect(
            &mut self,
            address: &DeviceAddress,
            options: ConnectOptions,
        ) -> Result<ConnectionHandle> {
            self.calls
                .push(PlatformCall::Connect(address.clone(), options));
            if !self.adapter_enabled {
                return Err(CgmError::AdapterUnavailable);
            }
            if self.connect_fails {
                return Err(btleplug::Error::DeviceNotFound.into());
            }
            let handle = ConnectionHandle::new(self.next_handle);
            self.next_handle += 1;
            Ok(handle)
        }

        fn disconnect(&mut self, handle: ConnectionHandle) {
            self.calls.push(PlatformCall::Disconnect(handle));
        }

        fn close(&mut self, handle: ConnectionHandle) {
            self.calls.push(PlatformCall::Close(handle));
        }

        fn request_connection_priority(
            &mut self,
            handle: ConnectionHandle,
            priority: ConnectionPriority,
        ) -> Result<()> {
            self.calls
                .push(PlatformCall::RequestPriority(handle, priority));
            Ok(())
        }

        fn request_mtu(&mut self, handle: ConnectionHandle, mtu: u16) -> Result<()> {
            self.calls.push(PlatformCall::RequestMtu(handle, mtu));
            if self.mtu_refused {
                return Err(CgmError::Unsupported("mtu"));
            }
            Ok(())
        }

        fn discover_services(&mut self, handle: ConnectionHandle) -> Result<()> {
            self.calls.push(PlatformCall::DiscoverServices(handle));
            if self.discovery_refused {
                return Err(CgmError::NotConnected);
            }
            Ok(())
        }

        fn read_characteristic(
            &mut self,
            handle: ConnectionHandle,
            characteristic: Uuid,
        ) -> Result<()> {
            self.calls.push(PlatformCall::Read(handle, characteristic));
            Ok(())
        }

        fn write_characteristic(
            &mut self,
            handle: ConnectionHandle,
            characteristic: Uuid,
            value: &[u8],
            _write_type: WriteType,
        ) -> Result<()> {
            self.calls
                .push(PlatformCall::Write(handle, characteristic, value.to_vec()));
            Ok(())
        }

        fn write_descriptor(
            &mut self,
            handle: ConnectionHandle,
            characteristic: Uuid,
            descriptor: Uuid,
            value: &[u8],
        ) -> Result<()> {
            self.calls.push(PlatformCall::WriteDescriptor(
                handle,
                characteristic,
                descriptor,
                value.to_vec(),
            ));
            Ok(())
        }

        fn set_notification(
            &mut self,
            handle: ConnectionHandle,
            characteristic: Uuid,
            enable: bool,
        ) -> Result<()> {
            self.calls
                .push(PlatformCall::SetNotification(handle, characteristic, enable));
            Ok(())
        }

        fn bond_state(&self, address: &DeviceAddress) -> BondState {
            if self.bonded.contains(address) {
                BondState::Bonded
            } else {
                BondState::None
            }
        }

        fn create_bond(&mut self, address: &DeviceAddress) -> Result<()> {
            self.calls.push(PlatformCall::CreateBond(address.clone()));
            if self.bond_refused {
                return Err(CgmError::Bonding("refused".to_string()));
            }
            Ok(())
        }

        fn unregister_bond_listener(&mut self) {
            self.calls.push(PlatformCall::UnregisterBondListener);
        }
    }
}
