use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{CgmError, Result},
    platform::{
        BlePlatform, BondState, ConnectOptions, ConnectionHandle, ConnectionPriority, EventSink,
        GattCharacteristic, GattService, PlatformEvent, GATT_ERROR, GATT_SUCCESS,
        STATUS_PEER_TERMINATED,
    },
    types::DeviceAddress,
    CCCD_UUID, CGMS_SERVICE_UUID,
};

type PeripheralMap = Arc<Mutex<HashMap<DeviceAddress, Peripheral>>>;
type LinkMap = Arc<Mutex<HashMap<ConnectionHandle, Peripheral>>>;

/// [`BlePlatform`] on top of `btleplug`
///
/// Every command spawns a tokio task that performs the `btleplug` call and
/// reports the outcome through the [`EventSink`]. Commands must therefore be
/// issued from within a tokio runtime.
///
/// `btleplug` has no API for MTU exchange, connection priority or pairing.
/// MTU and priority requests are refused as unsupported, and pairing is left
/// to the operating system: a bond request is recorded and reported as
/// [`BondState::Bonded`] right away.
#[derive(Debug)]
pub struct BtleplugPlatform {
    adapter: Option<Adapter>,
    sink: Option<EventSink>,
    peripherals: PeripheralMap,
    links: LinkMap,
    link_tasks: HashMap<ConnectionHandle, JoinHandle<()>>,
    adapter_task: Option<JoinHandle<()>>,
    scanning: Arc<AtomicBool>,
    bonded: HashSet<DeviceAddress>,
    bond_events: bool,
    next_handle: u64,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter of the system
    ///
    /// A system without adapters is not an error; the platform then reports
    /// itself unavailable and every scan request is refused.
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();

        match &adapter {
            Some(adapter) => info!(
                "Using Bluetooth adapter {}",
                adapter.adapter_info().await.unwrap_or_default()
            ),
            None => warn!("No Bluetooth adapter found"),
        }

        Ok(Self::with_adapter(adapter))
    }

    fn with_adapter(adapter: Option<Adapter>) -> Self {
        Self {
            adapter,
            sink: None,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            link_tasks: HashMap::new(),
            adapter_task: None,
            scanning: Arc::new(AtomicBool::new(false)),
            bonded: HashSet::new(),
            bond_events: true,
            next_handle: 0,
        }
    }

    fn sink(&self) -> Result<EventSink> {
        self.sink.clone().ok_or(CgmError::ChannelClosed)
    }

    /// Run `op` against the peripheral behind `handle` on a spawned task
    fn spawn_on_link<F, Fut>(&self, handle: ConnectionHandle, op: F) -> Result<()>
    where
        F: FnOnce(Peripheral, EventSink) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let sink = self.sink()?;
        let links = Arc::clone(&self.links);

        tokio::spawn(async move {
            let peripheral = links.lock().await.get(&handle).cloned();
            match peripheral {
                Some(peripheral) => op(peripheral, sink).await,
                None => debug!("Link {} is gone", handle),
            }
        });

        Ok(())
    }
}

impl BlePlatform for BtleplugPlatform {
    fn attach(&mut self, sink: EventSink) {
        if let Some(task) = self.adapter_task.take() {
            task.abort();
        }
        if let Some(adapter) = self.adapter.clone() {
            self.adapter_task = Some(tokio::spawn(pump_adapter_events(
                adapter,
                Arc::clone(&self.peripherals),
                Arc::clone(&self.links),
                Arc::clone(&self.scanning),
                sink.clone(),
            )));
        }
        self.sink = Some(sink);
    }

    fn adapter_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn start_scan(&mut self, service: Uuid) -> Result<()> {
        let adapter = self.adapter.clone().ok_or(CgmError::AdapterUnavailable)?;
        let sink = self.sink()?;
        let scanning = Arc::clone(&self.scanning);
        scanning.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let filter = ScanFilter {
                services: vec![service],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                scanning.store(false, Ordering::SeqCst);
                sink.emit(PlatformEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });

        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scanning.store(false, Ordering::SeqCst);
        if let Some(adapter) = self.adapter.clone() {
            tokio::spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("Stopping scan failed: {}", e);
                }
            });
        }
    }

    fn connect(
        &mut self,
        address: &DeviceAddress,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle> {
        let adapter = self.adapter.clone().ok_or(CgmError::AdapterUnavailable)?;
        let sink = self.sink()?;

        self.next_handle += 1;
        let handle = ConnectionHandle::new(self.next_handle);
        debug!("Opening link {} to {} with {:?}", handle, address, options);

        let task = tokio::spawn(run_link(
            adapter,
            Arc::clone(&self.peripherals),
            Arc::clone(&self.links),
            address.clone(),
            handle,
            sink,
        ));
        self.link_tasks.insert(handle, task);

        Ok(handle)
    }

    fn disconnect(&mut self, handle: ConnectionHandle) {
        let Ok(sink) = self.sink() else {
            return;
        };
        let links = Arc::clone(&self.links);

        tokio::spawn(async move {
            let Some(peripheral) = links.lock().await.remove(&handle) else {
                return;
            };
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect of link {} failed: {}", handle, e);
            }
            sink.emit(PlatformEvent::ConnectionStateChanged {
                handle,
                status: GATT_SUCCESS,
                connected: false,
            });
        });
    }

    fn close(&mut self, handle: ConnectionHandle) {
        if let Some(task) = self.link_tasks.remove(&handle) {
            task.abort();
        }
        let links = Arc::clone(&self.links);

        tokio::spawn(async move {
            let Some(peripheral) = links.lock().await.remove(&handle) else {
                return;
            };
            if peripheral.is_connected().await.unwrap_or(false) {
                let _ = peripheral.disconnect().await;
            }
        });
    }

    fn request_connection_priority(
        &mut self,
        _handle: ConnectionHandle,
        _priority: ConnectionPriority,
    ) -> Result<()> {
        Err(CgmError::Unsupported("connection priority"))
    }

    fn request_mtu(&mut self, _handle: ConnectionHandle, _mtu: u16) -> Result<()> {
        Err(CgmError::Unsupported("MTU exchange"))
    }

    fn discover_services(&mut self, handle: ConnectionHandle) -> Result<()> {
        self.spawn_on_link(handle, move |peripheral, sink| async move {
            let success = match peripheral.discover_services().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Service discovery on link {} failed: {}", handle, e);
                    false
                }
            };
            let services = peripheral.services().iter().map(gatt_service).collect();
            sink.emit(PlatformEvent::ServicesDiscovered {
                handle,
                success,
                services,
            });
        })
    }

    fn read_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<()> {
        self.spawn_on_link(handle, move |peripheral, sink| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(target) => peripheral.read(&target).await.map_err(CgmError::from),
                Err(e) => Err(e),
            };
            let (value, success) = match result {
                Ok(value) => (value, true),
                Err(e) => {
                    debug!("Read of {} failed: {}", characteristic, e);
                    (Vec::new(), false)
                }
            };
            sink.emit(PlatformEvent::CharacteristicRead {
                handle,
                characteristic,
                value,
                success,
            });
        })
    }

    fn write_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let value = value.to_vec();
        self.spawn_on_link(handle, move |peripheral, sink| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(target) => peripheral
                    .write(&target, &value, write_type)
                    .await
                    .map_err(CgmError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                debug!("Write to {} failed: {}", characteristic, e);
            }
            sink.emit(PlatformEvent::CharacteristicWritten {
                handle,
                characteristic,
                value,
                success: result.is_ok(),
            });
        })
    }

    fn write_descriptor(
        &mut self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let value = value.to_vec();
        self.spawn_on_link(handle, move |peripheral, sink| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                // btleplug writes the CCCD itself and picks notify or indicate
                Ok(target) if descriptor == CCCD_UUID => {
                    peripheral.subscribe(&target).await.map_err(CgmError::from)
                }
                Ok(target) => match target.descriptors.iter().find(|d| d.uuid == descriptor) {
                    Some(target) => peripheral
                        .write_descriptor(target, &value)
                        .await
                        .map_err(CgmError::from),
                    None => Err(CgmError::DescriptorNotFound {
                        characteristic,
                        descriptor,
                    }),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Descriptor write on {} failed: {}", characteristic, e);
            }
            sink.emit(PlatformEvent::DescriptorWritten {
                handle,
                characteristic,
                descriptor,
                success: result.is_ok(),
            });
        })
    }

    fn set_notification(
        &mut self,
        _handle: ConnectionHandle,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        // local delivery follows the CCCD write in btleplug
        debug!("Local notifications for {} set to {}", characteristic, enable);
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
        info!("Pairing with {} is handled by the operating system", address);
        self.bonded.insert(address.clone());

        if self.bond_events {
            self.sink()?.emit(PlatformEvent::BondStateChanged {
                address: address.clone(),
                state: BondState::Bonded,
            });
        }
        Ok(())
    }

    fn unregister_bond_listener(&mut self) {
        self.bond_events = false;
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        if let Some(task) = self.adapter_task.take() {
            task.abort();
        }
        for (_, task) in self.link_tasks.drain() {
            task.abort();
        }
    }
}

/// Forward scan results and disconnections from the adapter event stream
async fn pump_adapter_events(
    adapter: Adapter,
    peripherals: PeripheralMap,
    links: LinkMap,
    scanning: Arc<AtomicBool>,
    sink: EventSink,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Adapter events unavailable: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                if !properties.services.contains(&CGMS_SERVICE_UUID) {
                    continue;
                }

                let address = DeviceAddress::from(properties.address);
                peripherals
                    .lock()
                    .await
                    .insert(address.clone(), peripheral);

                let delivered = sink.emit(PlatformEvent::ScanResult {
                    address,
                    name: properties.local_name,
                    rssi: properties.rssi.unwrap_or(0),
                });
                if !delivered {
                    break;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let mut links = links.lock().await;
                let dropped: Vec<ConnectionHandle> = links
                    .iter()
                    .filter(|(_, p)| p.id() == id)
                    .map(|(handle, _)| *handle)
                    .collect();
                for handle in dropped {
                    links.remove(&handle);
                    sink.emit(PlatformEvent::ConnectionStateChanged {
                        handle,
                        status: STATUS_PEER_TERMINATED,
                        connected: false,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Connect, then forward notifications until the link task is aborted
async fn run_link(
    adapter: Adapter,
    peripherals: PeripheralMap,
    links: LinkMap,
    address: DeviceAddress,
    handle: ConnectionHandle,
    sink: EventSink,
) {
    let link_failed = |sink: &EventSink| {
        sink.emit(PlatformEvent::ConnectionStateChanged {
            handle,
            status: GATT_ERROR,
            connected: false,
        });
    };

    let Some(peripheral) = find_peripheral(&adapter, &peripherals, &address).await else {
        warn!("{} is not known to the adapter", address);
        link_failed(&sink);
        return;
    };

    if let Err(e) = peripheral.connect().await {
        warn!("Connecting to {} failed: {}", address, e);
        link_failed(&sink);
        return;
    }
    links.lock().await.insert(handle, peripheral.clone());

    let notifications = peripheral.notifications().await;
    sink.emit(PlatformEvent::ConnectionStateChanged {
        handle,
        status: GATT_SUCCESS,
        connected: true,
    });

    match notifications {
        Ok(mut stream) => {
            while let Some(notification) = stream.next().await {
                let delivered = sink.emit(PlatformEvent::CharacteristicChanged {
                    handle,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
                if !delivered {
                    break;
                }
            }
            debug!("Notification stream of link {} ended", handle);
        }
        Err(e) => warn!("Notifications unavailable on link {}: {}", handle, e),
    }
}

async fn find_peripheral(
    adapter: &Adapter,
    peripherals: &PeripheralMap,
    address: &DeviceAddress,
) -> Option<Peripheral> {
    if let Some(peripheral) = peripherals.lock().await.get(address) {
        return Some(peripheral.clone());
    }

    adapter
        .peripherals()
        .await
        .ok()?
        .into_iter()
        .find(|p| DeviceAddress::from(p.address()) == *address)
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(CgmError::CharacteristicNotFound(uuid))
}

fn gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                properties: c.properties,
                descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Event;
    use tokio::sync::mpsc;

    fn detached() -> (BtleplugPlatform, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut platform = BtleplugPlatform::with_adapter(None);
        platform.attach(EventSink::new(tx));
        (platform, rx)
    }

    #[tokio::test]
    async fn test_missing_adapter_refuses_requests() {
        let (mut platform, _rx) = detached();
        let address = DeviceAddress::from("00:11:22:33:44:55");

        assert!(!platform.adapter_available());
        assert!(matches!(
            platform.start_scan(CGMS_SERVICE_UUID),
            Err(CgmError::AdapterUnavailable)
        ));
        assert!(matches!(
            platform.connect(&address, ConnectOptions::default()),
            Err(CgmError::AdapterUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_link_controls_are_unsupported() {
        let (mut platform, _rx) = detached();
        let handle = ConnectionHandle::new(1);

        assert!(matches!(
            platform.request_mtu(handle, 185),
            Err(CgmError::Unsupported(_))
        ));
        assert!(matches!(
            platform.request_connection_priority(handle, ConnectionPriority::High),
            Err(CgmError::Unsupported(_))
        ));
        assert!(platform.set_notification(handle, CCCD_UUID, true).is_ok());
    }

    #[tokio::test]
    async fn test_bond_request_reports_bonded() {
        let (mut platform, mut rx) = detached();
        let address = DeviceAddress::from("00:11:22:33:44:55");

        assert_eq!(platform.bond_state(&address), BondState::None);
        platform.create_bond(&address).unwrap();
        assert_eq!(platform.bond_state(&address), BondState::Bonded);
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Platform(PlatformEvent::BondStateChanged {
                address: address.clone(),
                state: BondState::Bonded,
            })
        );

        platform.unregister_bond_listener();
        platform.create_bond(&address).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unattached_platform_has_no_sink() {
        let platform = BtleplugPlatform::with_adapter(None);
        assert!(matches!(platform.sink(), Err(CgmError::ChannelClosed)));
    }
}
