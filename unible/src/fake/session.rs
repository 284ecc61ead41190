use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicInfo, CharacteristicPath, CharacteristicProperties,
                            NotifyMode, WriteType};
use crate::filter::ScanFilter;
use crate::ingest::{Advertisement, RegistryEvent};
use crate::scan::ScanRecord;
use crate::session::{BackendSession, PinEntry};
use crate::{AvailabilityState, BackendEvent, CharacteristicHandle, DeviceHandle, DeviceId,
            GattError, GattResult, ListenerToken, Result, ServiceHandle, SubscriptionToken};

const DEFAULT_MTU: u16 = 23;

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: vec![],
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeService {
    pub uuid: Uuid,
    pub characteristics: Vec<FakeCharacteristic>,
    pub characteristic_discovery_error: Option<GattError>,
}

impl FakeService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: vec![],
            characteristic_discovery_error: None,
        }
    }

    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn fail_characteristic_discovery(mut self, error: GattError) -> Self {
        self.characteristic_discovery_error = Some(error);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakePeripheral {
    pub services: Vec<FakeService>,
    pub service_discovery_error: Option<GattError>,
    pub name: Option<String>,
    pub paired: bool,
    pub pin: Option<String>,
    pub mtu: u16,

    // Linked at the OS level by something other than this session
    pub system_connected: bool,
}

impl Default for FakePeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePeripheral {
    pub fn new() -> Self {
        Self {
            services: vec![],
            service_discovery_error: None,
            name: None,
            paired: false,
            pin: None,
            mtu: DEFAULT_MTU,
            system_connected: false,
        }
    }

    pub fn with_service(mut self, service: FakeService) -> Self {
        self.services.push(service);
        self
    }

    pub fn fail_service_discovery(mut self, error: GattError) -> Self {
        self.service_discovery_error = Some(error);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Reports the peripheral as connected by another application.
    pub fn connected_by_system(mut self) -> Self {
        self.system_connected = true;
        self
    }

    /// Pairing will require this PIN to be entered.
    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    fn characteristic_mut(&mut self, service: Uuid, characteristic: Uuid)
                          -> Option<&mut FakeCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)
    }
}

// Service handles are the 1-based index of the service, characteristic
// handles encode the service they belong to.
fn characteristic_handle(service: ServiceHandle, index: usize) -> CharacteristicHandle {
    CharacteristicHandle(service.0 * 0x100 + index as u32 + 1)
}

#[derive(Clone, Debug)]
pub struct FakeSession {
    inner: Arc<FakeSessionInner>,
}

#[derive(Debug)]
struct FakeSessionInner {
    backend_bus: StdMutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
    availability: StdRwLock<AvailabilityState>,
    peripherals: DashMap<DeviceId, FakePeripheral>,

    scanning: AtomicBool,
    scan_filter: StdMutex<Option<ScanFilter>>,
    stop_scan_calls: AtomicUsize,

    next_handle: AtomicU64,
    devices: DashMap<DeviceHandle, DeviceId>,
    status_listeners: DashMap<ListenerToken, DeviceId>,
    value_listeners: DashMap<SubscriptionToken, CharacteristicPath>,
    client_configuration: DashMap<(DeviceId, Uuid, Uuid), NotifyMode>,
    revoked_value_listeners: AtomicUsize,
    revoked_status_listeners: AtomicUsize,
    released_devices: AtomicUsize,
    fail_revocations: AtomicBool,
    drop_link_on_register: AtomicBool,

    connect_delay: StdMutex<Duration>,
    stop_scan_delay: StdMutex<Duration>,
    pairing_delay: StdMutex<Duration>,
    descriptor_write_delay: StdMutex<Duration>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        FakeSession {
            inner: Arc::new(FakeSessionInner {
                backend_bus: StdMutex::new(None),
                availability: StdRwLock::new(AvailabilityState::PoweredOn),
                peripherals: DashMap::new(),
                scanning: AtomicBool::new(false),
                scan_filter: StdMutex::new(None),
                stop_scan_calls: AtomicUsize::new(0),
                next_handle: AtomicU64::new(1),
                devices: DashMap::new(),
                status_listeners: DashMap::new(),
                value_listeners: DashMap::new(),
                client_configuration: DashMap::new(),
                revoked_value_listeners: AtomicUsize::new(0),
                revoked_status_listeners: AtomicUsize::new(0),
                released_devices: AtomicUsize::new(0),
                fail_revocations: AtomicBool::new(false),
                drop_link_on_register: AtomicBool::new(false),
                connect_delay: StdMutex::new(Duration::from_millis(0)),
                stop_scan_delay: StdMutex::new(Duration::from_millis(0)),
                pairing_delay: StdMutex::new(Duration::from_millis(0)),
                descriptor_write_delay: StdMutex::new(Duration::from_millis(0)),
            }),
        }
    }

    fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn device_id(&self, device: DeviceHandle) -> GattResult<DeviceId> {
        self.inner.devices.get(&device).map(|id| *id).ok_or(GattError::DeviceNotFound)
    }

    /// Pushes an event onto the backend bus, as if the platform had reported
    /// it. Returns false if no session has started with this backend.
    pub fn inject(&self, event: BackendEvent) -> bool {
        match &*self.inner.backend_bus.lock().unwrap() {
            Some(backend_bus) => backend_bus.send(event).is_ok(),
            None => {
                warn!("Fake backend event with no session: {:?}", event);
                false
            }
        }
    }

    pub fn add_peripheral(&self, device_id: DeviceId, peripheral: FakePeripheral) {
        self.inner.peripherals.insert(device_id, peripheral);
    }

    pub fn remove_peripheral(&self, device_id: DeviceId) {
        self.inner.peripherals.remove(&device_id);
    }

    /// Changes the radio state and reports it, even if it's unchanged.
    pub fn set_availability(&self, state: AvailabilityState) {
        *self.inner.availability.write().unwrap() = state;
        self.inject(BackendEvent::AvailabilityChanged(state));
    }

    /// Delivers an advertisement, if the advertisement watcher is running.
    pub fn advertise(&self, advertisement: Advertisement) {
        if self.is_scanning() {
            self.inject(BackendEvent::Advertisement(advertisement));
        }
    }

    /// Delivers a device registry event, if the registry watcher is running.
    pub fn registry_event(&self, event: RegistryEvent) {
        if self.is_scanning() {
            self.inject(BackendEvent::Registry(event));
        }
    }

    /// Sends a value change to every listener registered for the
    /// characteristic, returning how many there were.
    pub fn notify(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid,
                  value: Vec<u8>)
                  -> usize {
        let tokens: Vec<SubscriptionToken> =
            self.inner
                .value_listeners
                .iter()
                .filter(|entry| {
                    let path = entry.value();
                    path.device_id == device_id
                    && path.service_uuid == service
                    && path.characteristic_uuid == characteristic
                })
                .map(|entry| *entry.key())
                .collect();
        for token in tokens.iter() {
            self.inject(BackendEvent::ValueChanged {
                device_id,
                service,
                characteristic,
                token: *token,
                value: value.clone(),
            });
        }
        tokens.len()
    }

    /// Drops the link to a peripheral, notifying every connection status
    /// listener registered for it.
    pub fn disconnect(&self, device_id: DeviceId) {
        let listeners = self.inner
                            .status_listeners
                            .iter()
                            .filter(|entry| *entry.value() == device_id)
                            .count();
        trace!("Fake disconnect of {} ({} listeners)", device_id, listeners);
        for _ in 0..listeners {
            self.inject(BackendEvent::ConnectionStatusChanged {
                device_id,
                connected: false,
            });
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn scan_filter(&self) -> Option<ScanFilter> {
        self.inner.scan_filter.lock().unwrap().clone()
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.inner.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub fn value_listeners(&self) -> usize {
        self.inner.value_listeners.len()
    }

    pub fn status_listeners(&self) -> usize {
        self.inner.status_listeners.len()
    }

    pub fn revoked_value_listeners(&self) -> usize {
        self.inner.revoked_value_listeners.load(Ordering::SeqCst)
    }

    pub fn revoked_status_listeners(&self) -> usize {
        self.inner.revoked_status_listeners.load(Ordering::SeqCst)
    }

    pub fn released_devices(&self) -> usize {
        self.inner.released_devices.load(Ordering::SeqCst)
    }

    pub fn client_configuration(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
                                -> Option<NotifyMode> {
        self.inner
            .client_configuration
            .get(&(device_id, service, characteristic))
            .map(|mode| *mode)
    }

    pub fn characteristic_value(&self, device_id: DeviceId, service: Uuid, characteristic: Uuid)
                                -> Option<Vec<u8>> {
        let mut peripheral = self.inner.peripherals.get_mut(&device_id)?;
        peripheral.characteristic_mut(service, characteristic).map(|c| c.value.clone())
    }

    /// Makes every listener revocation fail, leaving the listener in place.
    pub fn set_fail_revocations(&self, fail: bool) {
        self.inner.fail_revocations.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_stop_scan_delay(&self, delay: Duration) {
        *self.inner.stop_scan_delay.lock().unwrap() = delay;
    }

    pub fn set_pairing_delay(&self, delay: Duration) {
        *self.inner.pairing_delay.lock().unwrap() = delay;
    }

    pub fn set_descriptor_write_delay(&self, delay: Duration) {
        *self.inner.descriptor_write_delay.lock().unwrap() = delay;
    }

    /// Drops the link the moment a connection status listener is registered,
    /// before the caller has had a chance to do anything else.
    pub fn set_drop_link_on_register(&self, drop_link: bool) {
        self.inner.drop_link_on_register.store(drop_link, Ordering::SeqCst);
    }

    fn check_revocation(&self) -> GattResult<()> {
        if self.inner.fail_revocations.load(Ordering::SeqCst) {
            Err(GattError::Other("revocation failed".to_string()))
        } else {
            Ok(())
        }
    }
}

async fn delay(duration: &StdMutex<Duration>) {
    let duration = *duration.lock().unwrap();
    if duration > Duration::from_millis(0) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl BackendSession for FakeSession {
    fn start(&self, backend_bus: mpsc::UnboundedSender<BackendEvent>) -> Result<()> {
        *self.inner.backend_bus.lock().unwrap() = Some(backend_bus);
        Ok(())
    }

    fn availability(&self) -> AvailabilityState {
        *self.inner.availability.read().unwrap()
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        *self.inner.scan_filter.lock().unwrap() = Some(filter.clone());
        self.inner.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        delay(&self.inner.stop_scan_delay).await;
        self.inner.scanning.store(false, Ordering::SeqCst);
        *self.inner.scan_filter.lock().unwrap() = None;
        Ok(())
    }

    async fn resolve_device(&self, device_id: DeviceId) -> GattResult<DeviceHandle> {
        delay(&self.inner.connect_delay).await;
        if !self.inner.peripherals.contains_key(&device_id) {
            return Err(GattError::DeviceNotFound);
        }
        let device = DeviceHandle(self.next_handle());
        self.inner.devices.insert(device, device_id);
        Ok(device)
    }

    async fn discover_services(&self, device: DeviceHandle) -> GattResult<Vec<(ServiceHandle, Uuid)>> {
        let device_id = self.device_id(device)?;
        let peripheral = self.inner.peripherals.get(&device_id).ok_or(GattError::Unreachable)?;
        if let Some(err) = &peripheral.service_discovery_error {
            return Err(err.clone());
        }
        Ok(peripheral.services
                     .iter()
                     .enumerate()
                     .map(|(i, service)| (ServiceHandle(i as u32 + 1), service.uuid))
                     .collect())
    }

    async fn discover_characteristics(&self, device: DeviceHandle, service: ServiceHandle)
                                      -> GattResult<Vec<CharacteristicInfo>> {
        let device_id = self.device_id(device)?;
        let peripheral = self.inner.peripherals.get(&device_id).ok_or(GattError::Unreachable)?;
        let fake_service = (service.0 as usize).checked_sub(1)
                                               .and_then(|i| peripheral.services.get(i))
                                               .ok_or(GattError::ProtocolError(None))?;
        if let Some(err) = &fake_service.characteristic_discovery_error {
            return Err(err.clone());
        }
        Ok(fake_service.characteristics
                       .iter()
                       .enumerate()
                       .map(|(i, c)| CharacteristicInfo {
                           handle: characteristic_handle(service, i),
                           uuid: c.uuid,
                           properties: c.properties,
                       })
                       .collect())
    }

    async fn read_characteristic(&self, path: &CharacteristicPath) -> GattResult<Vec<u8>> {
        self.characteristic_value(path.device_id, path.service_uuid, path.characteristic_uuid)
            .ok_or(GattError::Unreachable)
    }

    async fn write_characteristic(&self, path: &CharacteristicPath, _write_type: WriteType,
                                  data: &[u8])
                                  -> GattResult<()> {
        let mut peripheral = self.inner
                                 .peripherals
                                 .get_mut(&path.device_id)
                                 .ok_or(GattError::Unreachable)?;
        let characteristic = peripheral.characteristic_mut(path.service_uuid,
                                                           path.characteristic_uuid)
                                       .ok_or(GattError::Unreachable)?;
        characteristic.value = data.to_vec();
        Ok(())
    }

    async fn write_client_configuration(&self, path: &CharacteristicPath, mode: NotifyMode)
                                        -> GattResult<()> {
        self.device_id(path.device)?;
        delay(&self.inner.descriptor_write_delay).await;
        self.inner
            .client_configuration
            .insert((path.device_id, path.service_uuid, path.characteristic_uuid), mode);
        Ok(())
    }

    fn subscribe_value_changed(&self, path: &CharacteristicPath) -> GattResult<SubscriptionToken> {
        let token = SubscriptionToken(self.next_handle());
        self.inner.value_listeners.insert(token, *path);
        Ok(token)
    }

    fn revoke_value_changed(&self, _path: &CharacteristicPath, token: SubscriptionToken)
                            -> GattResult<()> {
        self.check_revocation()?;
        if self.inner.value_listeners.remove(&token).is_some() {
            self.inner.revoked_value_listeners.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn register_connection_status(&self, device_id: DeviceId, device: DeviceHandle)
                                  -> GattResult<ListenerToken> {
        self.device_id(device)?;
        let token = ListenerToken(self.next_handle());
        self.inner.status_listeners.insert(token, device_id);
        if self.inner.drop_link_on_register.load(Ordering::SeqCst) {
            self.disconnect(device_id);
        }
        Ok(token)
    }

    fn revoke_connection_status(&self, _device: DeviceHandle, token: ListenerToken)
                                -> GattResult<()> {
        self.check_revocation()?;
        if self.inner.status_listeners.remove(&token).is_some() {
            self.inner.revoked_status_listeners.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn release_device(&self, device: DeviceHandle) {
        if self.inner.devices.remove(&device).is_some() {
            self.inner.released_devices.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn max_pdu_size(&self, device: DeviceHandle) -> GattResult<u16> {
        let device_id = self.device_id(device)?;
        let peripheral = self.inner.peripherals.get(&device_id).ok_or(GattError::Unreachable)?;
        Ok(peripheral.mtu)
    }

    async fn system_connected_devices(&self, with_services: &[Uuid]) -> GattResult<Vec<ScanRecord>> {
        let connected: Vec<DeviceId> = self.inner.devices.iter().map(|entry| *entry.value()).collect();
        let mut records: Vec<ScanRecord> =
            self.inner
                .peripherals
                .iter()
                .filter(|entry| entry.system_connected || connected.contains(entry.key()))
                .filter(|entry| {
                    with_services.is_empty()
                    || entry.services.iter().any(|service| with_services.contains(&service.uuid))
                })
                .map(|entry| {
                    let mut record = ScanRecord::new(*entry.key());
                    record.name = entry.name.clone();
                    record.is_paired = Some(entry.paired);
                    record
                })
                .collect();
        records.sort_by_key(|record| record.device_id.as_u64());
        Ok(records)
    }

    async fn is_paired(&self, device_id: DeviceId) -> GattResult<bool> {
        let peripheral = self.inner.peripherals.get(&device_id).ok_or(GattError::DeviceNotFound)?;
        Ok(peripheral.paired)
    }

    async fn pair(&self, device_id: DeviceId, pin_entry: Option<Arc<dyn PinEntry>>)
                  -> GattResult<()> {
        delay(&self.inner.pairing_delay).await;

        let required_pin = self.inner
                               .peripherals
                               .get(&device_id)
                               .ok_or(GattError::DeviceNotFound)?
                               .pin
                               .clone();
        if let Some(required_pin) = required_pin {
            let entered = match pin_entry {
                Some(pin_entry) => pin_entry.request_pin().await,
                None => None,
            };
            if entered.as_deref() != Some(required_pin.as_str()) {
                return Err(GattError::AccessDenied);
            }
        }

        let mut peripheral = self.inner
                                 .peripherals
                                 .get_mut(&device_id)
                                 .ok_or(GattError::DeviceNotFound)?;
        peripheral.paired = true;
        Ok(())
    }

    async fn unpair(&self, device_id: DeviceId) -> GattResult<()> {
        let mut peripheral = self.inner
                                 .peripherals
                                 .get_mut(&device_id)
                                 .ok_or(GattError::DeviceNotFound)?;
        peripheral.paired = false;
        Ok(())
    }

    fn flush(&self, id: u32) -> Result<()> {
        self.inject(BackendEvent::Flush(id));
        Ok(())
    }
}
